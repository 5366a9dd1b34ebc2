//! Negotiation engines behind peer links.
//!
//! A [`Negotiator`] creates one [`LinkTransport`] per peer link. Transports do their
//! work on background tasks and report back through [`LinkEvents`], which routes
//! results onto the owning session's queue tagged with the link generation. Once the
//! link's token is cancelled, further events are dropped at the source.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;

use crate::connection::Role;
use crate::error::Result;
use crate::media::{LocalMediaSource, MediaKind, RemoteStream};
use crate::room::SessionCommand;
use crate::signaling::{ParticipantId, Signal};

/// Generation number distinguishing successive links to the same participant.
pub type LinkId = u64;

#[derive(Debug)]
pub enum LinkEvent {
    /// Outbound payload to relay to the remote side.
    Signal(Signal),
    Connected,
    Stream(RemoteStream),
    Closed,
    Failed(String),
}

/// Event sink handed to a transport, bound to one link generation.
#[derive(Clone, Debug)]
pub struct LinkEvents {
    peer: ParticipantId,
    link: LinkId,
    mailbox: mpsc::WeakSender<SessionCommand>,
    cancel: CancellationToken,
}

impl LinkEvents {
    pub(crate) fn new(
        peer: ParticipantId,
        link: LinkId,
        mailbox: mpsc::WeakSender<SessionCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            peer,
            link,
            mailbox,
            cancel,
        }
    }

    #[must_use]
    pub fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub async fn emit(&self, event: LinkEvent) {
        if self.cancel.is_cancelled() {
            debug!(
                target: "mesh.link",
                peer_id = %self.peer,
                link_id = self.link,
                ?event,
                "Dropping event from torn-down link"
            );
            return;
        }
        let Some(mailbox) = self.mailbox.upgrade() else {
            return;
        };
        let _ = mailbox
            .send(SessionCommand::Link {
                peer: self.peer.clone(),
                link: self.link,
                event,
            })
            .await;
    }
}

/// Per-link handle to a running negotiation.
pub trait LinkTransport: Send + Sync {
    /// Apply a payload received from the remote side.
    fn signal(&self, payload: Signal);

    /// Replace outgoing tracks with those of `source`.
    fn replace_source(&self, source: Arc<LocalMediaSource>);

    /// Tear down; must not emit further events.
    fn close(&self);
}

pub trait Negotiator: Send + Sync {
    /// Start negotiating a link. Initiators emit their first signal unprompted.
    fn create(
        &self,
        role: Role,
        source: Arc<LocalMediaSource>,
        events: LinkEvents,
    ) -> Result<Box<dyn LinkTransport>>;

    /// `source` was released and no link sends it any more.
    fn release_source(&self, _source: &LocalMediaSource) {}
}

/// How the loopback negotiator reacts to inbound payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoopbackBehavior {
    #[default]
    Connect,
    /// Responders never answer, leaving the initiator negotiating.
    Stall,
    /// Every inbound payload fails the link.
    Fail,
}

/// In-process negotiation without a media transport.
///
/// Offers and answers are small JSON objects listing the sender's track kinds; the
/// remote side reports one [`RemoteStream`] per listed kind once connected.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNegotiator {
    behavior: LoopbackBehavior,
}

impl LoopbackNegotiator {
    #[must_use]
    pub fn new(behavior: LoopbackBehavior) -> Self {
        Self { behavior }
    }
}

impl Negotiator for LoopbackNegotiator {
    fn create(
        &self,
        role: Role,
        source: Arc<LocalMediaSource>,
        events: LinkEvents,
    ) -> Result<Box<dyn LinkTransport>> {
        let transport = LoopbackTransport {
            role,
            behavior: self.behavior,
            source,
            events,
        };
        if role == Role::Initiator {
            let offer = transport.description("offer");
            let events = transport.events.clone();
            tokio::spawn(async move { events.emit(LinkEvent::Signal(offer)).await });
        }
        Ok(Box::new(transport))
    }
}

struct LoopbackTransport {
    role: Role,
    behavior: LoopbackBehavior,
    source: Arc<LocalMediaSource>,
    events: LinkEvents,
}

impl LoopbackTransport {
    fn description(&self, kind: &str) -> Signal {
        let tracks: Vec<MediaKind> = self.source.tracks().iter().map(|t| t.kind()).collect();
        Signal::new(json!({
            "type": kind,
            "stream": self.source.id(),
            "tracks": tracks,
        }))
    }
}

impl LinkTransport for LoopbackTransport {
    fn signal(&self, payload: Signal) {
        let events = self.events.clone();
        let behavior = self.behavior;
        let role = self.role;
        let answer = self.description("answer");

        tokio::spawn(async move {
            if behavior == LoopbackBehavior::Fail {
                events
                    .emit(LinkEvent::Failed("loopback negotiation refused".to_string()))
                    .await;
                return;
            }
            let value = payload.into_value();
            let kind = value.get("type").and_then(|t| t.as_str()).unwrap_or_default();
            match (role, kind) {
                (Role::Responder, "offer") => {
                    if behavior == LoopbackBehavior::Stall {
                        return;
                    }
                    events.emit(LinkEvent::Signal(answer)).await;
                    events.emit(LinkEvent::Connected).await;
                }
                (Role::Initiator, "answer") => events.emit(LinkEvent::Connected).await,
                _ => {
                    events
                        .emit(LinkEvent::Failed(format!("unexpected {kind:?} payload for {role}")))
                        .await;
                    return;
                }
            }
            for stream in remote_streams(&value) {
                events.emit(LinkEvent::Stream(stream)).await;
            }
        });
    }

    fn replace_source(&self, source: Arc<LocalMediaSource>) {
        debug!(
            target: "mesh.link",
            peer_id = %self.events.peer(),
            source_id = source.id(),
            "Loopback source replaced"
        );
    }

    fn close(&self) {}
}

fn remote_streams(description: &serde_json::Value) -> Vec<RemoteStream> {
    let stream_id = description
        .get("stream")
        .and_then(|s| s.as_str())
        .unwrap_or_default()
        .to_owned();
    let kinds: Vec<MediaKind> = description
        .get("tracks")
        .cloned()
        .and_then(|t| serde_json::from_value(t).ok())
        .unwrap_or_default();

    kinds
        .into_iter()
        .map(|kind| RemoteStream {
            track_id: format!("{stream_id}-{kind}"),
            stream_id: stream_id.clone(),
            kind,
            track: None,
        })
        .collect()
}
