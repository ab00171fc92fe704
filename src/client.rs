//! Client session library used by every agent
//!
//! Symmetric to the broker's session handling: hides framing, keeps a
//! read-only replica of the roster and reservations, and emits heartbeats.

mod replica;
mod session;

pub use replica::Replica;
pub use session::{
    ListenerId, Registration, Session, SessionError, SessionResult, CHANNEL_TIMEOUT, DM_TIMEOUT,
    HEARTBEAT_INTERVAL, LIST_TIMEOUT, RESERVATION_TIMEOUT,
};
