//! Full-mesh room signaling.
//!
//! Participants join a room through a relay and end up with one negotiated peer link
//! to every other member. [`RoomSession`] orchestrates membership and link lifecycles;
//! the relay, media capture and negotiation engine are pluggable collaborators.

pub mod audio;
pub mod config;
pub mod connection;
pub mod error;
pub mod media;
pub mod metrics;
pub mod negotiator;
pub mod relay;
pub mod room;
pub mod signaling;
pub mod webrtc;

pub use crate::config::Config;
pub use crate::connection::{LinkState, PeerSnapshot, Role};
pub use crate::error::{Error, ProtocolError, Result};
pub use crate::media::{LocalMediaSource, MediaKind, RemoteStream, SourceKind};
pub use crate::metrics::MetricsSnapshot;
pub use crate::room::{Collaborators, RemovalReason, RoomSession, RoomSessionHandle, SessionEvent};
pub use crate::signaling::ParticipantId;
