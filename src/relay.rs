//! Rendezvous relay.
//!
//! [`Relay`] keeps room membership and forwards signals between members of the same
//! room. It is transport-agnostic: every member is an unbounded sender of
//! [`SignalingMessage`]s. [`serve`] exposes it over WebSocket and [`LocalConnector`]
//! attaches in-process clients.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::signaling::{Connector, ParticipantId, SignalingChannel, SignalingMessage};

struct Member {
    tx: mpsc::UnboundedSender<SignalingMessage>,
    room: Option<String>,
}

#[derive(Default)]
struct RelayState {
    members: HashMap<ParticipantId, Member>,
    /// Room code to members in join order.
    rooms: HashMap<String, Vec<ParticipantId>>,
}

impl RelayState {
    fn deliver(&self, to: &ParticipantId, msg: SignalingMessage) {
        if let Some(member) = self.members.get(to) {
            let _ = member.tx.send(msg);
        }
    }

    fn room_of(&self, id: &ParticipantId) -> Option<&str> {
        self.members.get(id).and_then(|m| m.room.as_deref())
    }

    fn same_room(&self, a: &ParticipantId, b: &ParticipantId) -> bool {
        matches!((self.room_of(a), self.room_of(b)), (Some(x), Some(y)) if x == y)
    }
}

#[derive(Default)]
pub struct Relay {
    state: Mutex<RelayState>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a connection and greet it with a fresh id.
    pub fn register(&self, tx: mpsc::UnboundedSender<SignalingMessage>) -> ParticipantId {
        let mut state = self.state();
        let id = loop {
            let candidate = ParticipantId::new(format!("{:016x}", rand::random::<u64>()));
            if !state.members.contains_key(&candidate) {
                break candidate;
            }
        };
        let _ = tx.send(SignalingMessage::Welcome { id: id.clone() });
        state.members.insert(id.clone(), Member { tx, room: None });
        debug!(target: "mesh.relay", participant_id = %id, "Participant connected");
        id
    }

    /// Route one message received from `from`.
    pub fn dispatch(&self, from: &ParticipantId, msg: SignalingMessage) {
        let mut state = self.state();
        if !state.members.contains_key(from) {
            return;
        }

        match msg {
            SignalingMessage::JoinRoom(room) => {
                if let Some(current) = state.room_of(from) {
                    warn!(
                        target: "mesh.relay",
                        participant_id = %from,
                        room_id = current,
                        "Ignoring join-room from a member already in a room"
                    );
                    return;
                }
                let members = state.rooms.entry(room.clone()).or_default();
                let others = members.clone();
                members.push(from.clone());
                if let Some(member) = state.members.get_mut(from) {
                    member.room = Some(room.clone());
                }
                info!(
                    target: "mesh.relay",
                    participant_id = %from,
                    room_id = %room,
                    members = others.len() + 1,
                    "Participant joined room"
                );
                state.deliver(from, SignalingMessage::AllUsers(others));
            }
            SignalingMessage::SendingSignal {
                user_to_signal,
                signal,
                ..
            } => {
                if !state.same_room(from, &user_to_signal) {
                    debug!(target: "mesh.relay", participant_id = %from, to = %user_to_signal, "Dropping signal outside room");
                    return;
                }
                state.deliver(
                    &user_to_signal,
                    SignalingMessage::UserJoined {
                        caller_id: from.clone(),
                        signal,
                    },
                );
            }
            SignalingMessage::ReturningSignal { signal, caller_id } => {
                if !state.same_room(from, &caller_id) {
                    debug!(target: "mesh.relay", participant_id = %from, to = %caller_id, "Dropping signal outside room");
                    return;
                }
                state.deliver(
                    &caller_id,
                    SignalingMessage::ReceivingReturnedSignal {
                        id: from.clone(),
                        signal,
                    },
                );
            }
            other => {
                warn!(
                    target: "mesh.relay",
                    participant_id = %from,
                    event = other.name(),
                    "Ignoring client message"
                );
            }
        }
    }

    /// Forget `id` and tell the rest of its room.
    pub fn disconnect(&self, id: &ParticipantId) {
        let mut state = self.state();
        let Some(member) = state.members.remove(id) else {
            return;
        };
        let Some(room) = member.room else {
            debug!(target: "mesh.relay", participant_id = %id, "Participant disconnected");
            return;
        };

        let remaining = match state.rooms.get_mut(&room) {
            Some(members) => {
                members.retain(|m| m != id);
                members.clone()
            }
            None => Vec::new(),
        };
        if remaining.is_empty() {
            state.rooms.remove(&room);
        }
        for other in &remaining {
            state.deliver(other, SignalingMessage::UserLeft { id: id.clone() });
        }
        info!(
            target: "mesh.relay",
            participant_id = %id,
            room_id = %room,
            remaining = remaining.len(),
            "Participant left room"
        );
    }

    #[must_use]
    pub fn room_members(&self, room: &str) -> Vec<ParticipantId> {
        self.state().rooms.get(room).cloned().unwrap_or_default()
    }
}

/// Connects sessions to an in-process [`Relay`]. The relay address is ignored.
#[derive(Clone)]
pub struct LocalConnector {
    relay: Arc<Relay>,
}

impl LocalConnector {
    #[must_use]
    pub fn new(relay: Arc<Relay>) -> Self {
        Self { relay }
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, _relay_address: &str) -> Result<SignalingChannel> {
        let (to_client, mut client_inbound) = mpsc::unbounded_channel();
        let (client_outbound, mut from_client) = mpsc::unbounded_channel();
        let id = self.relay.register(to_client);

        // The welcome is already queued; consume it the way a remote client would.
        match client_inbound.recv().await {
            Some(SignalingMessage::Welcome { .. }) => {}
            _ => {
                self.relay.disconnect(&id);
                return Err(Error::Connection("relay did not assign an id".to_string()));
            }
        }

        let relay = Arc::clone(&self.relay);
        let member = id.clone();
        tokio::spawn(async move {
            while let Some(msg) = from_client.recv().await {
                relay.dispatch(&member, msg);
            }
            relay.disconnect(&member);
        });

        Ok(SignalingChannel::new(id, client_outbound, client_inbound))
    }
}

/// Pause after a failed accept so a persistent error such as fd exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept WebSocket clients until `shutdown` fires.
pub async fn serve(relay: Arc<Relay>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
    info!(target: "mesh.relay", addr = %listener.local_addr()?, "Relay listening");
    serve_connections(relay, incoming(listener), shutdown).await;
    Ok(())
}

fn incoming(listener: TcpListener) -> impl Stream<Item = io::Result<(TcpStream, SocketAddr)>> {
    stream::unfold(listener, |listener| async move {
        let accepted = listener.accept().await;
        Some((accepted, listener))
    })
}

/// Serve every accepted connection. Accept errors are logged and skipped.
async fn serve_connections<S>(relay: Arc<Relay>, connections: S, shutdown: CancellationToken)
where
    S: Stream<Item = io::Result<(TcpStream, SocketAddr)>>,
{
    tokio::pin!(connections);
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = connections.next() => accepted,
        };
        let (stream, addr) = match accepted {
            Some(Ok(connection)) => connection,
            Some(Err(e)) => {
                warn!(target: "mesh.relay", error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
            None => break,
        };
        let relay = Arc::clone(&relay);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(relay, stream, addr, shutdown).await {
                warn!(target: "mesh.relay", %addr, error = %e, "Client connection failed");
            }
        });
    }
    info!(target: "mesh.relay", "Relay stopped");
}

async fn handle_client(
    relay: Arc<Relay>,
    stream: TcpStream,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalingMessage>();
    let id = relay.register(tx);
    debug!(target: "mesh.relay", %addr, participant_id = %id, "WebSocket client accepted");

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!(target: "mesh.relay", error = %e, "Failed to encode message");
                    continue;
                }
            };
            if write.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => break,
            frame = read.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<SignalingMessage>(&text) {
                Ok(msg) => relay.dispatch(&id, msg),
                Err(e) => {
                    warn!(target: "mesh.relay", participant_id = %id, error = %e, "Discarding malformed message");
                }
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(target: "mesh.relay", participant_id = %id, error = %e, "Socket error");
                break;
            }
        }
    }

    // Dropping the member's sender ends the writer.
    relay.disconnect(&id);
    let _ = writer.await;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::signaling::Signal;
    use serde_json::json;

    fn member(relay: &Relay) -> (ParticipantId, mpsc::UnboundedReceiver<SignalingMessage>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = relay.register(tx);
        assert_eq!(rx.try_recv().unwrap(), SignalingMessage::Welcome { id: id.clone() });
        (id, rx)
    }

    #[test]
    fn test_join_answers_with_existing_members() {
        let relay = Relay::new();
        let (a, mut a_rx) = member(&relay);
        let (b, mut b_rx) = member(&relay);

        relay.dispatch(&a, SignalingMessage::JoinRoom("abc123".into()));
        assert_eq!(a_rx.try_recv().unwrap(), SignalingMessage::AllUsers(vec![]));

        relay.dispatch(&b, SignalingMessage::JoinRoom("abc123".into()));
        assert_eq!(b_rx.try_recv().unwrap(), SignalingMessage::AllUsers(vec![a.clone()]));
        assert_eq!(relay.room_members("abc123"), vec![a, b]);
    }

    #[test]
    fn test_signals_are_forwarded_with_sender_identity() {
        let relay = Relay::new();
        let (a, mut a_rx) = member(&relay);
        let (b, mut b_rx) = member(&relay);
        relay.dispatch(&a, SignalingMessage::JoinRoom("r".into()));
        relay.dispatch(&b, SignalingMessage::JoinRoom("r".into()));
        a_rx.try_recv().unwrap();
        b_rx.try_recv().unwrap();

        let offer = Signal::new(json!({"type": "offer"}));
        relay.dispatch(
            &b,
            SignalingMessage::SendingSignal {
                user_to_signal: a.clone(),
                caller_id: "spoofed".into(),
                signal: offer.clone(),
            },
        );
        assert_eq!(
            a_rx.try_recv().unwrap(),
            SignalingMessage::UserJoined {
                caller_id: b.clone(),
                signal: offer
            }
        );

        let answer = Signal::new(json!({"type": "answer"}));
        relay.dispatch(
            &a,
            SignalingMessage::ReturningSignal {
                signal: answer.clone(),
                caller_id: b.clone(),
            },
        );
        assert_eq!(
            b_rx.try_recv().unwrap(),
            SignalingMessage::ReceivingReturnedSignal { id: a, signal: answer }
        );
    }

    #[test]
    fn test_signal_to_other_room_is_dropped() {
        let relay = Relay::new();
        let (a, mut a_rx) = member(&relay);
        let (b, _b_rx) = member(&relay);
        relay.dispatch(&a, SignalingMessage::JoinRoom("one".into()));
        relay.dispatch(&b, SignalingMessage::JoinRoom("two".into()));
        a_rx.try_recv().unwrap();

        relay.dispatch(
            &b,
            SignalingMessage::SendingSignal {
                user_to_signal: a,
                caller_id: b.clone(),
                signal: Signal::new(json!({})),
            },
        );
        assert!(a_rx.try_recv().is_err());
    }

    #[test]
    fn test_disconnect_broadcasts_user_left() {
        let relay = Relay::new();
        let (a, mut a_rx) = member(&relay);
        let (b, _b_rx) = member(&relay);
        relay.dispatch(&a, SignalingMessage::JoinRoom("r".into()));
        relay.dispatch(&b, SignalingMessage::JoinRoom("r".into()));
        a_rx.try_recv().unwrap();

        relay.disconnect(&b);
        assert_eq!(a_rx.try_recv().unwrap(), SignalingMessage::UserLeft { id: b });
        assert_eq!(relay.room_members("r"), vec![a.clone()]);

        relay.disconnect(&a);
        assert!(relay.room_members("r").is_empty());
    }

    #[test]
    fn test_second_join_is_ignored() {
        let relay = Relay::new();
        let (a, mut a_rx) = member(&relay);
        relay.dispatch(&a, SignalingMessage::JoinRoom("r".into()));
        a_rx.try_recv().unwrap();
        relay.dispatch(&a, SignalingMessage::JoinRoom("other".into()));
        assert!(a_rx.try_recv().is_err());
        assert!(relay.room_members("other").is_empty());
    }

    #[tokio::test]
    async fn test_local_connector_assigns_id() {
        let relay = Arc::new(Relay::new());
        let connector = LocalConnector::new(Arc::clone(&relay));
        let mut channel = connector.connect("local").await.unwrap();
        let id = channel.local_id().clone();

        channel.send(SignalingMessage::JoinRoom("r".into())).unwrap();
        assert_eq!(channel.recv().await.unwrap(), SignalingMessage::AllUsers(vec![]));
        assert_eq!(relay.room_members("r"), vec![id]);
    }

    #[tokio::test]
    async fn test_failed_accept_keeps_serving() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let aborted = stream::once(async {
            Err::<(TcpStream, SocketAddr), _>(io::Error::from(io::ErrorKind::ConnectionAborted))
        });
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve_connections(
            Arc::new(Relay::new()),
            aborted.chain(incoming(listener)),
            shutdown.clone(),
        ));

        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let welcome = ws.next().await.unwrap().unwrap().into_text().unwrap();
        assert!(welcome.contains("welcome"));
        assert!(!server.is_finished());

        shutdown.cancel();
        server.await.unwrap();
    }
}
