use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

use crate::signaling::ParticipantId;

/// Signaling-level faults that are always recovered locally.
///
/// Network reordering and retransmission make these expected; the session logs
/// and counts them, then discards the offending event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("duplicate join from {0}")]
    DuplicateJoin(ParticipantId),

    #[error("signal from unknown peer {0}")]
    UnknownPeer(ParticipantId),

    #[error("stale signal for {peer} in state {state}")]
    StaleSignal { peer: ParticipantId, state: String },

    #[error("unexpected {0} event")]
    UnexpectedEvent(&'static str),
}

#[derive(Debug, Error)]
pub enum Error {
    /// The relay cannot be reached. Fatal to join, retryable by the caller.
    #[error("connection error: {0}")]
    Connection(String),

    /// Local capture denied, unavailable or timed out. Fatal to join.
    #[error("media access error: {0}")]
    MediaAccess(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A single peer link failed; never escalates past that link.
    #[error("negotiation with {peer} failed: {reason}")]
    Negotiation { peer: ParticipantId, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("room session is closed")]
    SessionClosed,

    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::from(ProtocolError::UnknownPeer(ParticipantId::from("ghost")));
        assert_eq!(err.to_string(), "protocol error: signal from unknown peer ghost");
    }
}
