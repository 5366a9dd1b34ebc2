//! Peer link lifecycle.
//!
//! A [`PeerLink`] is one negotiated point-to-point connection to a single remote
//! participant. It owns the negotiation transport and enforces the state machine:
//!
//! ```text
//! Created -> SignalPending -> Negotiating -> Connected -> Closed
//!     \____________\_______________\____________\______-> Failed
//! ```
//!
//! The link never interprets signal payloads; it only decides whether one may be
//! accepted in the current state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ProtocolError;
use crate::media::LocalMediaSource;
use crate::negotiator::{LinkId, LinkTransport};
use crate::signaling::{ParticipantId, Signal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Created,
    SignalPending,
    Negotiating,
    Connected,
    Closed,
    Failed,
}

impl LinkState {
    /// Whether an inbound negotiation payload may be applied.
    #[must_use]
    pub fn accepts_signal(self) -> bool {
        matches!(self, LinkState::SignalPending | LinkState::Negotiating)
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Closed | LinkState::Failed)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Created => write!(f, "Created"),
            LinkState::SignalPending => write!(f, "SignalPending"),
            LinkState::Negotiating => write!(f, "Negotiating"),
            LinkState::Connected => write!(f, "Connected"),
            LinkState::Closed => write!(f, "Closed"),
            LinkState::Failed => write!(f, "Failed"),
        }
    }
}

/// Which side proposes first in a pairwise negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Initiator,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

pub struct PeerLink {
    remote: ParticipantId,
    id: LinkId,
    role: Role,
    state: LinkState,
    source: Arc<LocalMediaSource>,
    transport: Box<dyn LinkTransport>,
    cancel: CancellationToken,
    remote_streams: usize,
    opened_at: Instant,
}

impl PeerLink {
    /// Create the link and move it straight to `SignalPending`.
    pub fn open(
        remote: ParticipantId,
        id: LinkId,
        role: Role,
        source: Arc<LocalMediaSource>,
        transport: Box<dyn LinkTransport>,
        cancel: CancellationToken,
    ) -> Self {
        let mut link = Self {
            remote,
            id,
            role,
            state: LinkState::Created,
            source,
            transport,
            cancel,
            remote_streams: 0,
            opened_at: Instant::now(),
        };
        link.transition(LinkState::SignalPending);
        link
    }

    #[must_use]
    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    #[must_use]
    pub fn id(&self) -> LinkId {
        self.id
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn state(&self) -> LinkState {
        self.state
    }

    #[must_use]
    pub fn source(&self) -> &Arc<LocalMediaSource> {
        &self.source
    }

    /// Feed an inbound payload from the remote side.
    ///
    /// Outside `SignalPending`/`Negotiating` the payload is stale or duplicated and is
    /// rejected without touching the transport.
    pub fn signal(&mut self, payload: Signal) -> Result<(), ProtocolError> {
        if !self.state.accepts_signal() {
            return Err(self.stale());
        }
        if self.role == Role::Responder && self.state == LinkState::SignalPending {
            self.transition(LinkState::Negotiating);
        }
        self.transport.signal(payload);
        Ok(())
    }

    /// Record that the transport produced an outbound payload.
    pub fn local_signal(&mut self) -> Result<(), ProtocolError> {
        if self.state.is_terminal() {
            return Err(self.stale());
        }
        if self.role == Role::Initiator && self.state == LinkState::SignalPending {
            self.transition(LinkState::Negotiating);
        }
        Ok(())
    }

    /// Returns `true` on the transition into `Connected`, `false` if already there.
    pub fn connected(&mut self) -> Result<bool, ProtocolError> {
        match self.state {
            LinkState::Connected => Ok(false),
            state if state.accepts_signal() => {
                self.transition(LinkState::Connected);
                Ok(true)
            }
            _ => Err(self.stale()),
        }
    }

    /// Count a stream handed to the rendering sink.
    pub fn record_remote_stream(&mut self) {
        self.remote_streams += 1;
    }

    /// Swap outgoing media on a connected link.
    pub fn replace_source(&mut self, source: Arc<LocalMediaSource>) {
        if self.state != LinkState::Connected {
            return;
        }
        self.transport.replace_source(Arc::clone(&source));
        self.source = source;
    }

    pub fn fail(&mut self) {
        self.shutdown(LinkState::Failed);
    }

    pub fn close(&mut self) {
        self.shutdown(LinkState::Closed);
    }

    /// Point-in-time view for observers.
    #[must_use]
    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            peer: self.remote.clone(),
            role: self.role,
            state: self.state,
            source_id: self.source.id().to_owned(),
            remote_streams: self.remote_streams,
        }
    }

    fn shutdown(&mut self, terminal: LinkState) {
        if self.state.is_terminal() {
            return;
        }
        self.transition(terminal);
        // Cancelling first drops anything the transport is still producing.
        self.cancel.cancel();
        self.transport.close();
    }

    fn transition(&mut self, next: LinkState) {
        debug!(
            target: "mesh.link",
            peer_id = %self.remote,
            link_id = self.id,
            role = %self.role,
            from = %self.state,
            to = %next,
            elapsed_ms = self.opened_at.elapsed().as_millis() as u64,
            "Link state changed"
        );
        self.state = next;
    }

    fn stale(&self) -> ProtocolError {
        ProtocolError::StaleSignal {
            peer: self.remote.clone(),
            state: self.state.to_string(),
        }
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("remote", &self.remote)
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("source", &self.source.id())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub peer: ParticipantId,
    pub role: Role,
    pub state: LinkState,
    pub source_id: String,
    pub remote_streams: usize,
}

/// Publishes the session's peer set to any number of observers.
#[derive(Clone, Debug)]
pub struct ConnectionMonitor {
    status: Arc<watch::Sender<Vec<PeerSnapshot>>>,
    receiver: watch::Receiver<Vec<PeerSnapshot>>,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(Vec::new());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    pub fn publish(&self, peers: Vec<PeerSnapshot>) {
        self.status.send_if_modified(|current| {
            if *current == peers {
                false
            } else {
                *current = peers;
                true
            }
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<PeerSnapshot>> {
        self.receiver.clone()
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}
