//! `RoomSession` - per-room orchestrator actor.
//!
//! Each `RoomSession`:
//! - Owns the map of peer links for one room, keyed by remote participant
//! - Receives relay events, link events, timers and handle requests on a single
//!   mailbox, processed one at a time, so link bookkeeping needs no locks
//! - Creates an initiator link per member listed in `all-users` and a responder
//!   link per `user-joined`, relaying each link's outbound signals by participant id
//!
//! # Lifecycle
//!
//! 1. [`RoomSession::join`] connects the signaling channel, acquires local media and
//!    emits `join-room`
//! 2. Runs until [`RoomSessionHandle::leave`] or until every handle is dropped
//! 3. Leaving cancels the session token; link tokens are children of it, so any
//!    in-flight negotiation output is dropped before it reaches the mailbox

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::connection::{ConnectionMonitor, LinkState, PeerLink, PeerSnapshot, Role};
use crate::error::{Error, ProtocolError, Result};
use crate::media::{LocalMediaSource, MediaAcquirer, MediaKind, RemoteStream, SourceKind};
use crate::metrics::{MetricsSnapshot, SessionMetrics};
use crate::negotiator::{LinkEvent, LinkEvents, LinkId, Negotiator};
use crate::signaling::{
    Connector, ParticipantId, RelayEvent, Signal, SignalingMessage, SignalingSender,
};

use super::state::RoomState;

/// Default channel buffer size for the session mailbox.
const SESSION_CHANNEL_BUFFER: usize = 256;

/// Everything the session reacts to, in arrival order.
#[derive(Debug)]
pub enum SessionCommand {
    /// Inbound relay event, or the reason it could not be typed.
    Relay(std::result::Result<RelayEvent, ProtocolError>),
    /// The relay connection closed.
    SignalingLost,
    Link {
        peer: ParticipantId,
        link: LinkId,
        event: LinkEvent,
    },
    NegotiationTimeout {
        peer: ParticipantId,
        link: LinkId,
    },
    SourceEnded {
        source_id: String,
    },
    SwitchSource {
        source: LocalMediaSource,
        respond_to: oneshot::Sender<()>,
    },
    Toggle {
        kind: MediaKind,
        respond_to: oneshot::Sender<Option<bool>>,
    },
    Leave {
        respond_to: oneshot::Sender<()>,
    },
}

/// Notifications for the rendering side.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PeerAdded { peer: ParticipantId, role: Role },
    PeerConnected { peer: ParticipantId },
    RemoteStream { peer: ParticipantId, stream: RemoteStream },
    PeerRemoved { peer: ParticipantId, reason: RemovalReason },
    LocalSourceChanged { source_id: String, kind: SourceKind },
    /// The relay is gone; established links keep streaming but no new peers arrive.
    SignalingLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalReason {
    /// The relay reported the participant gone.
    Left,
    Closed,
    Failed(String),
}

/// External capabilities a session is built from.
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn Connector>,
    pub media: Arc<dyn MediaAcquirer>,
    pub negotiator: Arc<dyn Negotiator>,
}

/// Handle to a running `RoomSession`.
///
/// Cloneable; the session leaves the room once the last handle is dropped.
#[derive(Clone, Debug)]
pub struct RoomSessionHandle {
    sender: mpsc::Sender<SessionCommand>,
    room_id: String,
    local_id: ParticipantId,
    peers: watch::Receiver<Vec<PeerSnapshot>>,
    metrics: Arc<SessionMetrics>,
}

impl RoomSessionHandle {
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    #[must_use]
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Current links, ordered by participant id.
    #[must_use]
    pub fn peers(&self) -> Vec<PeerSnapshot> {
        self.peers.borrow().clone()
    }

    pub fn subscribe_peers(&self) -> watch::Receiver<Vec<PeerSnapshot>> {
        self.peers.clone()
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Use `source` for links created from now on.
    pub async fn switch_local_source(&self, source: LocalMediaSource) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::SwitchSource {
                source,
                respond_to: tx,
            })
            .await
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Flip local audio tracks. `None` when the source has no audio track.
    pub async fn toggle_local_audio(&self) -> Result<Option<bool>> {
        self.toggle(MediaKind::Audio).await
    }

    /// Flip local video tracks. `None` when the source has no video track.
    pub async fn toggle_local_video(&self) -> Result<Option<bool>> {
        self.toggle(MediaKind::Video).await
    }

    /// Close every link, disconnect from the relay and release local media.
    /// Calling it again, from any clone, does nothing.
    pub async fn leave(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SessionCommand::Leave { respond_to: tx })
            .await
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }

    async fn toggle(&self, kind: MediaKind) -> Result<Option<bool>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::Toggle {
                kind,
                respond_to: tx,
            })
            .await
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)
    }
}

pub struct RoomSession {
    room: RoomState,
    signaling: Option<SignalingSender>,
    source: Option<Arc<LocalMediaSource>>,
    /// Camera source to restore when a screen share ends.
    fallback: Option<Arc<LocalMediaSource>>,
    /// Every source installed and not yet released, current and fallback included.
    retained: Vec<Arc<LocalMediaSource>>,
    negotiator: Arc<dyn Negotiator>,
    mailbox: mpsc::WeakSender<SessionCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
    monitor: ConnectionMonitor,
    metrics: Arc<SessionMetrics>,
    cancel: CancellationToken,
    negotiation_timeout: Duration,
    live_source_replacement: bool,
    left: bool,
}

impl RoomSession {
    /// Join `room_id` and spawn the session actor.
    ///
    /// Fails with [`Error::Connection`] if the relay cannot be reached and with
    /// [`Error::MediaAccess`] if local capture is denied, unavailable or does not
    /// answer within the configured media timeout.
    pub async fn join(
        room_id: &str,
        config: &Config,
        collaborators: Collaborators,
    ) -> Result<(RoomSessionHandle, mpsc::UnboundedReceiver<SessionEvent>)> {
        let Collaborators {
            connector,
            media,
            negotiator,
        } = collaborators;

        info!(target: "mesh.session", room_id, relay = %config.relay_url, "Joining room");

        let channel = timeout(config.connect_timeout(), connector.connect(&config.relay_url))
            .await
            .map_err(|_| {
                Error::Connection(format!("timed out connecting to {}", config.relay_url))
            })??;

        // Dropping the channel on the error paths below disconnects from the relay.
        let source = match timeout(config.media_timeout(), media.acquire(&config.media)).await {
            Ok(Ok(source)) => source,
            Ok(Err(Error::MediaAccess(reason))) => return Err(Error::MediaAccess(reason)),
            Ok(Err(other)) => return Err(Error::MediaAccess(other.to_string())),
            Err(_) => {
                return Err(Error::MediaAccess(format!(
                    "no local media after {} ms",
                    config.media_timeout().as_millis()
                )))
            }
        };

        let (local_id, signaling, inbound) = channel.into_parts();
        signaling.send(SignalingMessage::JoinRoom(room_id.to_owned()))?;

        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let (session, events) = RoomSession::new(
            RoomState::new(room_id.to_owned(), local_id),
            signaling,
            source,
            negotiator,
            sender.downgrade(),
            config,
        );
        spawn_signaling_pump(inbound, sender.downgrade(), session.cancel.clone());

        let handle = session.handle_for(sender);
        let span = info_span!("room_session", room_id, local_id = %handle.local_id());
        tokio::spawn(session.run(receiver).instrument(span));

        info!(
            target: "mesh.session",
            room_id,
            local_id = %handle.local_id(),
            "Joined room"
        );
        Ok((handle, events))
    }

    pub(crate) fn new(
        room: RoomState,
        signaling: SignalingSender,
        source: LocalMediaSource,
        negotiator: Arc<dyn Negotiator>,
        mailbox: mpsc::WeakSender<SessionCommand>,
        config: &Config,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let source = Arc::new(source);
        let session = Self {
            room,
            signaling: Some(signaling),
            source: Some(Arc::clone(&source)),
            fallback: None,
            retained: vec![Arc::clone(&source)],
            negotiator,
            mailbox,
            events,
            monitor: ConnectionMonitor::new(),
            metrics: Arc::new(SessionMetrics::new()),
            cancel: CancellationToken::new(),
            negotiation_timeout: config.negotiation_timeout(),
            live_source_replacement: config.live_source_replacement,
            left: false,
        };
        session.watch_source(&source);
        (session, events_rx)
    }

    fn handle_for(&self, sender: mpsc::Sender<SessionCommand>) -> RoomSessionHandle {
        RoomSessionHandle {
            sender,
            room_id: self.room.id().to_owned(),
            local_id: self.room.local_id().clone(),
            peers: self.monitor.subscribe(),
            metrics: Arc::clone(&self.metrics),
        }
    }

    async fn run(mut self, mut receiver: mpsc::Receiver<SessionCommand>) {
        debug!(target: "mesh.session", "RoomSession started");

        while let Some(command) = receiver.recv().await {
            if self.handle(command) {
                break;
            }
        }

        // Reached without an explicit leave when every handle was dropped.
        self.leave();

        info!(
            target: "mesh.session",
            metrics = ?self.metrics.snapshot(),
            "RoomSession stopped"
        );
    }

    /// Handle a single command. Returns true if the session should stop.
    pub(crate) fn handle(&mut self, command: SessionCommand) -> bool {
        if self.left {
            match command {
                SessionCommand::Leave { respond_to } => {
                    let _ = respond_to.send(());
                }
                other => {
                    debug!(target: "mesh.session", command = ?other, "Ignoring command after leave");
                }
            }
            return true;
        }

        match command {
            SessionCommand::Relay(Ok(event)) => self.on_relay_event(event),
            SessionCommand::Relay(Err(err)) => self.protocol_error(&err),
            SessionCommand::SignalingLost => self.on_signaling_lost(),
            SessionCommand::Link { peer, link, event } => self.on_link_event(&peer, link, event),
            SessionCommand::NegotiationTimeout { peer, link } => {
                self.on_negotiation_timeout(&peer, link);
            }
            SessionCommand::SourceEnded { source_id } => self.on_source_ended(&source_id),
            SessionCommand::SwitchSource { source, respond_to } => {
                self.switch_local_source(source);
                let _ = respond_to.send(());
            }
            SessionCommand::Toggle { kind, respond_to } => {
                let _ = respond_to.send(self.toggle_local(kind));
            }
            SessionCommand::Leave { respond_to } => {
                self.leave();
                let _ = respond_to.send(());
                return true;
            }
        }

        self.monitor.publish(self.room.snapshot());
        false
    }

    fn on_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::AllUsers(users) => self.on_all_users(users),
            RelayEvent::UserJoined { caller_id, signal } => self.on_user_joined(caller_id, signal),
            RelayEvent::ReturnedSignal { from, signal } => self.on_returned_signal(&from, signal),
            RelayEvent::UserLeft(peer) => self.on_user_left(&peer),
        }
    }

    /// Members already present: we initiate towards each. Additive, so ids that
    /// reached us first through `user-joined` keep their existing link.
    fn on_all_users(&mut self, users: Vec<ParticipantId>) {
        info!(target: "mesh.session", count = users.len(), "Received room membership");

        let mut seen = HashSet::new();
        for peer in users {
            if &peer == self.room.local_id() || !seen.insert(peer.clone()) {
                continue;
            }
            if self.room.contains(&peer) {
                debug!(target: "mesh.session", peer_id = %peer, "Already linked, skipping");
                continue;
            }
            self.create_link(peer, Role::Initiator);
        }
    }

    fn on_user_joined(&mut self, caller: ParticipantId, signal: Signal) {
        if self.room.contains(&caller) {
            self.protocol_error(&ProtocolError::DuplicateJoin(caller));
            return;
        }
        if !self.create_link(caller.clone(), Role::Responder) {
            return;
        }
        let result = match self.room.get_mut(&caller) {
            Some(link) => link.signal(signal),
            None => return,
        };
        if let Err(err) = result {
            self.protocol_error(&err);
        }
    }

    fn on_returned_signal(&mut self, from: &ParticipantId, signal: Signal) {
        let result = match self.room.get_mut(from) {
            Some(link) => link.signal(signal),
            None => Err(ProtocolError::UnknownPeer(from.clone())),
        };
        if let Err(err) = result {
            self.protocol_error(&err);
        }
    }

    fn on_user_left(&mut self, peer: &ParticipantId) {
        if self.room.contains(peer) {
            info!(target: "mesh.session", peer_id = %peer, "Participant left");
            self.remove_link(peer, RemovalReason::Left);
        } else {
            debug!(target: "mesh.session", peer_id = %peer, "Unlinked participant left");
        }
    }

    fn on_signaling_lost(&mut self) {
        if self.signaling.take().is_some() {
            warn!(
                target: "mesh.session",
                links = self.room.len(),
                "Lost connection to relay"
            );
            self.emit(SessionEvent::SignalingLost);
        }
    }

    fn on_link_event(&mut self, peer: &ParticipantId, link_id: LinkId, event: LinkEvent) {
        let local_id = self.room.local_id().clone();
        let Some(link) = self.room.current_mut(peer, link_id) else {
            debug!(
                target: "mesh.session",
                peer_id = %peer,
                link_id,
                ?event,
                "Discarding event from retired link"
            );
            return;
        };

        match event {
            LinkEvent::Signal(signal) => {
                let role = link.role();
                if let Err(err) = link.local_signal() {
                    self.protocol_error(&err);
                    return;
                }
                let message = match role {
                    Role::Initiator => SignalingMessage::SendingSignal {
                        user_to_signal: peer.clone(),
                        caller_id: local_id,
                        signal,
                    },
                    Role::Responder => SignalingMessage::ReturningSignal {
                        signal,
                        caller_id: peer.clone(),
                    },
                };
                self.relay(message);
            }
            LinkEvent::Connected => match link.connected() {
                Ok(true) => {
                    self.metrics.record_link_connected();
                    info!(target: "mesh.session", peer_id = %peer, "Peer connected");
                    self.emit(SessionEvent::PeerConnected { peer: peer.clone() });
                }
                Ok(false) => {}
                Err(err) => self.protocol_error(&err),
            },
            LinkEvent::Stream(stream) => {
                link.record_remote_stream();
                self.emit(SessionEvent::RemoteStream {
                    peer: peer.clone(),
                    stream,
                });
            }
            LinkEvent::Closed => self.remove_link(peer, RemovalReason::Closed),
            LinkEvent::Failed(reason) => self.fail_link(peer, reason),
        }
    }

    fn on_negotiation_timeout(&mut self, peer: &ParticipantId, link_id: LinkId) {
        let expired = self
            .room
            .current_mut(peer, link_id)
            .is_some_and(|link| link.state() != LinkState::Connected);
        if expired {
            let reason = format!(
                "not connected after {} ms",
                self.negotiation_timeout.as_millis()
            );
            self.fail_link(peer, reason);
        }
    }

    fn on_source_ended(&mut self, source_id: &str) {
        let is_current = self.source.as_ref().is_some_and(|s| s.id() == source_id);
        if !is_current {
            debug!(target: "mesh.session", source_id, "Inactive local source ended");
            return;
        }
        match self.fallback.take() {
            Some(fallback) => {
                info!(
                    target: "mesh.session",
                    source_id,
                    fallback_id = fallback.id(),
                    "Local source ended, restoring previous source"
                );
                self.install_source(fallback);
                self.release_unused();
            }
            None => {
                warn!(target: "mesh.session", source_id, "Local source ended with nothing to restore");
            }
        }
    }

    fn switch_local_source(&mut self, source: LocalMediaSource) {
        let source = Arc::new(source);
        let previous = self.source.clone();

        if source.kind() == SourceKind::Screen {
            if let Some(camera) = previous.filter(|p| p.kind() == SourceKind::Camera) {
                self.fallback = Some(camera);
            }
        } else {
            self.fallback = None;
        }

        self.watch_source(&source);
        self.retained.push(Arc::clone(&source));
        self.install_source(source);
        self.release_unused();
    }

    fn install_source(&mut self, source: Arc<LocalMediaSource>) {
        if self.live_source_replacement {
            for link in self.room.links_mut() {
                link.replace_source(Arc::clone(&source));
            }
        }
        info!(
            target: "mesh.session",
            source_id = source.id(),
            kind = ?source.kind(),
            "Local source changed"
        );
        self.emit(SessionEvent::LocalSourceChanged {
            source_id: source.id().to_owned(),
            kind: source.kind(),
        });
        self.source = Some(source);
    }

    fn toggle_local(&mut self, kind: MediaKind) -> Option<bool> {
        let state = self.source.as_ref().and_then(|source| source.toggle(kind));
        match state {
            Some(enabled) => info!(target: "mesh.session", %kind, enabled, "Toggled local tracks"),
            None => debug!(target: "mesh.session", %kind, "No local tracks to toggle"),
        }
        state
    }

    fn leave(&mut self) {
        if self.left {
            return;
        }
        self.left = true;
        self.cancel.cancel();

        let closed = self.room.len();
        for mut link in self.room.drain() {
            link.close();
            self.metrics.record_link_closed();
        }
        self.signaling = None;
        self.source = None;
        self.fallback = None;
        for source in std::mem::take(&mut self.retained) {
            self.release_source(&source);
        }
        self.monitor.publish(Vec::new());

        info!(
            target: "mesh.session",
            room_id = self.room.id(),
            links_closed = closed,
            "Left room"
        );
    }

    /// Start a link towards `peer`. Returns false if no link was registered.
    fn create_link(&mut self, peer: ParticipantId, role: Role) -> bool {
        let Some(source) = self.source.clone() else {
            return false;
        };
        let link_id = self.room.next_link_id();
        let cancel = self.cancel.child_token();
        let events = LinkEvents::new(peer.clone(), link_id, self.mailbox.clone(), cancel.clone());

        let transport = match self.negotiator.create(role, Arc::clone(&source), events) {
            Ok(transport) => transport,
            Err(e) => {
                cancel.cancel();
                self.metrics.record_link_failed();
                warn!(
                    target: "mesh.session",
                    peer_id = %peer,
                    %role,
                    error = %e,
                    "Failed to start negotiation"
                );
                return false;
            }
        };

        let link = PeerLink::open(peer.clone(), link_id, role, source, transport, cancel.clone());
        if let Err(err) = self.room.add_peer(link) {
            cancel.cancel();
            self.protocol_error(&err);
            return false;
        }
        self.metrics.record_link_created();
        self.arm_negotiation_timeout(peer.clone(), link_id, cancel);

        info!(target: "mesh.session", peer_id = %peer, %role, link_id, "Peer link created");
        self.emit(SessionEvent::PeerAdded { peer, role });
        true
    }

    fn remove_link(&mut self, peer: &ParticipantId, reason: RemovalReason) {
        if let Some(mut link) = self.room.remove_peer(peer) {
            link.close();
            self.metrics.record_link_closed();
            self.emit(SessionEvent::PeerRemoved {
                peer: peer.clone(),
                reason,
            });
            self.release_unused();
        }
    }

    /// Negotiation failure: isolated to this link.
    fn fail_link(&mut self, peer: &ParticipantId, reason: String) {
        if let Some(mut link) = self.room.remove_peer(peer) {
            link.fail();
            self.metrics.record_link_failed();
            let error = Error::Negotiation {
                peer: peer.clone(),
                reason: reason.clone(),
            };
            warn!(target: "mesh.session", peer_id = %peer, %error, "Peer link failed");
            self.emit(SessionEvent::PeerRemoved {
                peer: peer.clone(),
                reason: RemovalReason::Failed(reason),
            });
            self.release_unused();
        }
    }

    /// Release retained sources that are neither current, the fallback, nor sent
    /// on any link.
    fn release_unused(&mut self) {
        let (unused, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retained)
            .into_iter()
            .partition(|source| !self.holds(source));
        self.retained = kept;
        for source in unused {
            self.release_source(&source);
        }
    }

    fn holds(&self, source: &Arc<LocalMediaSource>) -> bool {
        let in_slot = |slot: &Option<Arc<LocalMediaSource>>| {
            slot.as_ref().is_some_and(|held| Arc::ptr_eq(held, source))
        };
        in_slot(&self.source) || in_slot(&self.fallback) || self.room.uses_source(source)
    }

    fn release_source(&self, source: &LocalMediaSource) {
        debug!(target: "mesh.session", source_id = source.id(), "Releasing local source");
        source.release();
        self.negotiator.release_source(source);
    }

    fn relay(&self, message: SignalingMessage) {
        let event = message.name();
        let Some(signaling) = &self.signaling else {
            warn!(target: "mesh.session", event, "No relay connection, dropping outbound signal");
            return;
        };
        match signaling.send(message) {
            Ok(()) => self.metrics.record_signal_relayed(),
            Err(e) => warn!(target: "mesh.session", event, error = %e, "Failed to relay signal"),
        }
    }

    fn protocol_error(&self, err: &ProtocolError) {
        self.metrics.record_protocol_error();
        warn!(target: "mesh.session", error = %err, "Discarding signaling event");
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn arm_negotiation_timeout(&self, peer: ParticipantId, link: LinkId, cancel: CancellationToken) {
        let mailbox = self.mailbox.clone();
        let wait = self.negotiation_timeout;
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(wait) => {
                    if let Some(tx) = mailbox.upgrade() {
                        let _ = tx.send(SessionCommand::NegotiationTimeout { peer, link }).await;
                    }
                }
            }
        });
    }

    fn watch_source(&self, source: &Arc<LocalMediaSource>) {
        let source = Arc::clone(source);
        let mailbox = self.mailbox.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                () = source.ended() => {
                    if let Some(tx) = mailbox.upgrade() {
                        let _ = tx
                            .send(SessionCommand::SourceEnded {
                                source_id: source.id().to_owned(),
                            })
                            .await;
                    }
                }
            }
        });
    }
}

/// Translate inbound wire messages into session commands, preserving order.
fn spawn_signaling_pump(
    mut inbound: mpsc::UnboundedReceiver<SignalingMessage>,
    mailbox: mpsc::WeakSender<SessionCommand>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                message = inbound.recv() => message,
            };
            let (command, last) = match message {
                Some(message) => (SessionCommand::Relay(RelayEvent::try_from(message)), false),
                None => (SessionCommand::SignalingLost, true),
            };
            let Some(tx) = mailbox.upgrade() else {
                return;
            };
            if tx.send(command).await.is_err() || last {
                return;
            }
        }
    });
}
