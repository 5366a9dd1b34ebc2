//! Signaling channel: wire vocabulary, typed relay events, and the client transport.
//!
//! Every message is a JSON object `{"event": <name>, "data": <payload>}`. The channel
//! is ordered and fire-and-forget on send; inbound messages are translated into
//! [`RelayEvent`] commands before they reach the room session.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::{Error, ProtocolError, Result};

/// Relay-assigned identifier of a connected signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Opaque negotiation payload (offer, answer or candidate update).
///
/// Only negotiators look inside; the session routes it untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signal(serde_json::Value);

impl Signal {
    #[must_use]
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    #[must_use]
    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Relay -> client: identity assigned to this connection.
    Welcome { id: ParticipantId },
    /// Client -> relay.
    JoinRoom(String),
    /// Relay -> client: members present before the join, sent once.
    AllUsers(Vec<ParticipantId>),
    /// Relay -> client: a newcomer's initial signal.
    UserJoined {
        #[serde(rename = "callerID")]
        caller_id: ParticipantId,
        signal: Signal,
    },
    /// Client -> relay: initiator signal addressed to `user_to_signal`.
    SendingSignal {
        #[serde(rename = "userToSignal")]
        user_to_signal: ParticipantId,
        #[serde(rename = "callerID")]
        caller_id: ParticipantId,
        signal: Signal,
    },
    /// Client -> relay: responder signal addressed back to `caller_id`.
    ReturningSignal {
        signal: Signal,
        #[serde(rename = "callerID")]
        caller_id: ParticipantId,
    },
    /// Relay -> client: a responder's signal.
    ReceivingReturnedSignal { id: ParticipantId, signal: Signal },
    /// Relay -> client: a member disconnected.
    UserLeft { id: ParticipantId },
}

impl SignalingMessage {
    /// Wire event name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            SignalingMessage::Welcome { .. } => "welcome",
            SignalingMessage::JoinRoom(_) => "join-room",
            SignalingMessage::AllUsers(_) => "all-users",
            SignalingMessage::UserJoined { .. } => "user-joined",
            SignalingMessage::SendingSignal { .. } => "sending-signal",
            SignalingMessage::ReturningSignal { .. } => "returning-signal",
            SignalingMessage::ReceivingReturnedSignal { .. } => "receiving-returned-signal",
            SignalingMessage::UserLeft { .. } => "user-left",
        }
    }
}

/// Inbound relay event, as delivered to the room session's queue.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    AllUsers(Vec<ParticipantId>),
    UserJoined {
        caller_id: ParticipantId,
        signal: Signal,
    },
    ReturnedSignal {
        from: ParticipantId,
        signal: Signal,
    },
    UserLeft(ParticipantId),
}

impl TryFrom<SignalingMessage> for RelayEvent {
    type Error = ProtocolError;

    fn try_from(msg: SignalingMessage) -> std::result::Result<Self, Self::Error> {
        match msg {
            SignalingMessage::AllUsers(users) => Ok(RelayEvent::AllUsers(users)),
            SignalingMessage::UserJoined { caller_id, signal } => {
                Ok(RelayEvent::UserJoined { caller_id, signal })
            }
            SignalingMessage::ReceivingReturnedSignal { id, signal } => {
                Ok(RelayEvent::ReturnedSignal { from: id, signal })
            }
            SignalingMessage::UserLeft { id } => Ok(RelayEvent::UserLeft(id)),
            other => Err(ProtocolError::UnexpectedEvent(other.name())),
        }
    }
}

/// Cloneable, ordered, fire-and-forget sending half of a channel.
#[derive(Debug, Clone)]
pub struct SignalingSender {
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

impl SignalingSender {
    pub fn send(&self, msg: SignalingMessage) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| Error::Connection("signaling channel closed".to_string()))
    }
}

/// A connected channel to the relay with its assigned identity.
#[derive(Debug)]
pub struct SignalingChannel {
    local_id: ParticipantId,
    outbound: SignalingSender,
    inbound: mpsc::UnboundedReceiver<SignalingMessage>,
}

impl SignalingChannel {
    pub fn new(
        local_id: ParticipantId,
        outbound: mpsc::UnboundedSender<SignalingMessage>,
        inbound: mpsc::UnboundedReceiver<SignalingMessage>,
    ) -> Self {
        Self {
            local_id,
            outbound: SignalingSender { tx: outbound },
            inbound,
        }
    }

    /// Wait for the relay's `welcome` and build the channel around it.
    pub async fn handshake(
        outbound: mpsc::UnboundedSender<SignalingMessage>,
        mut inbound: mpsc::UnboundedReceiver<SignalingMessage>,
        wait: Duration,
    ) -> Result<Self> {
        match timeout(wait, inbound.recv()).await {
            Ok(Some(SignalingMessage::Welcome { id })) => Ok(Self::new(id, outbound, inbound)),
            Ok(Some(other)) => Err(Error::Connection(format!(
                "relay sent {} before assigning an id",
                other.name()
            ))),
            Ok(None) => Err(Error::Connection(
                "relay closed the channel during handshake".to_string(),
            )),
            Err(_) => Err(Error::Connection(
                "timed out waiting for relay to assign an id".to_string(),
            )),
        }
    }

    #[must_use]
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn send(&self, msg: SignalingMessage) -> Result<()> {
        self.outbound.send(msg)
    }

    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.inbound.recv().await
    }

    pub fn into_parts(
        self,
    ) -> (
        ParticipantId,
        SignalingSender,
        mpsc::UnboundedReceiver<SignalingMessage>,
    ) {
        (self.local_id, self.outbound, self.inbound)
    }
}

/// Establishes a [`SignalingChannel`] to a relay address.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, relay_address: &str) -> Result<SignalingChannel>;
}

/// WebSocket transport carrying JSON text frames.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, relay_address: &str) -> Result<SignalingChannel> {
        let (ws_stream, _) = timeout(self.connect_timeout, connect_async(relay_address))
            .await
            .map_err(|_| Error::Connection(format!("timed out connecting to {relay_address}")))?
            .map_err(|e| Error::Connection(format!("{relay_address}: {e}")))?;
        let (mut write, mut read) = ws_stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<SignalingMessage>();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        // Outgoing messages; dropping every sender closes the socket.
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(target: "mesh.signaling", error = %e, "Failed to encode message"),
                }
            }
            let _ = write.close().await;
            debug!(target: "mesh.signaling", "Signaling writer stopped");
        });

        // Incoming messages
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<SignalingMessage>(&text) {
                        Ok(msg) => {
                            if incoming_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(target: "mesh.signaling", error = %e, "Discarding malformed message");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(target: "mesh.signaling", error = %e, "Signaling socket failed");
                        break;
                    }
                }
            }
            debug!(target: "mesh.signaling", "Signaling reader stopped");
        });

        SignalingChannel::handshake(outgoing_tx, incoming_rx, self.connect_timeout).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_wire_shapes() {
        let join = serde_json::to_value(SignalingMessage::JoinRoom("abc123".into())).unwrap();
        assert_eq!(join, json!({"event": "join-room", "data": "abc123"}));

        let sending = serde_json::to_value(SignalingMessage::SendingSignal {
            user_to_signal: "b".into(),
            caller_id: "a".into(),
            signal: Signal::new(json!({"type": "offer", "sdp": "v=0"})),
        })
        .unwrap();
        assert_eq!(
            sending,
            json!({
                "event": "sending-signal",
                "data": {"userToSignal": "b", "callerID": "a", "signal": {"type": "offer", "sdp": "v=0"}}
            })
        );

        let returning = serde_json::to_value(SignalingMessage::ReturningSignal {
            signal: Signal::new(json!({"type": "answer"})),
            caller_id: "a".into(),
        })
        .unwrap();
        assert_eq!(
            returning,
            json!({"event": "returning-signal", "data": {"signal": {"type": "answer"}, "callerID": "a"}})
        );
    }

    #[test]
    fn test_inbound_parse_into_relay_events() {
        let all: SignalingMessage =
            serde_json::from_str(r#"{"event":"all-users","data":["x","y"]}"#).unwrap();
        assert_eq!(
            RelayEvent::try_from(all).unwrap(),
            RelayEvent::AllUsers(vec!["x".into(), "y".into()])
        );

        let joined: SignalingMessage = serde_json::from_str(
            r#"{"event":"user-joined","data":{"callerID":"x","signal":{"type":"offer"}}}"#,
        )
        .unwrap();
        assert_eq!(
            RelayEvent::try_from(joined).unwrap(),
            RelayEvent::UserJoined {
                caller_id: "x".into(),
                signal: Signal::new(json!({"type": "offer"})),
            }
        );

        let returned: SignalingMessage = serde_json::from_str(
            r#"{"event":"receiving-returned-signal","data":{"id":"y","signal":{"type":"answer"}}}"#,
        )
        .unwrap();
        assert!(matches!(
            RelayEvent::try_from(returned).unwrap(),
            RelayEvent::ReturnedSignal { from, .. } if from.as_str() == "y"
        ));
    }

    #[test]
    fn test_outbound_event_is_not_a_relay_event() {
        let err = RelayEvent::try_from(SignalingMessage::JoinRoom("r".into())).unwrap_err();
        assert_eq!(err, ProtocolError::UnexpectedEvent("join-room"));
    }

    #[tokio::test]
    async fn test_handshake_requires_welcome() {
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        in_tx
            .send(SignalingMessage::Welcome { id: "me".into() })
            .unwrap();
        in_tx.send(SignalingMessage::AllUsers(vec![])).unwrap();

        let mut channel = SignalingChannel::handshake(out_tx, in_rx, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(channel.local_id().as_str(), "me");
        assert_eq!(channel.recv().await, Some(SignalingMessage::AllUsers(vec![])));
    }

    #[tokio::test]
    async fn test_handshake_rejects_other_first_message() {
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        in_tx.send(SignalingMessage::AllUsers(vec![])).unwrap();

        let err = SignalingChannel::handshake(out_tx, in_rx, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_times_out() {
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let (_in_tx, in_rx) = mpsc::unbounded_channel::<SignalingMessage>();

        let err = SignalingChannel::handshake(out_tx, in_rx, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }
}
