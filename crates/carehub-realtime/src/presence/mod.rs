//! Workspace presence: who is online, their status, and what they view.

pub mod room;
pub mod roster;
pub mod status;

pub use room::PresenceRoom;
pub use roster::{PresenceRecord, PresenceRoster};
pub use status::PresenceStatus;
