//! Room membership and the per-room session actor.

pub mod session;
pub mod state;

pub use session::{
    Collaborators, RemovalReason, RoomSession, RoomSessionHandle, SessionCommand, SessionEvent,
};
pub use state::RoomState;
