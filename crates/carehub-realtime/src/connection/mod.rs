//! Connection health: status machine, heartbeat, and reconnect backoff.

pub mod health;
pub mod heartbeat;
pub mod status;

pub use health::{ConnectionHealthManager, HealthSettings};
pub use heartbeat::{HealthProbe, StaticProbe};
pub use status::{ConnectionState, ConnectionStatus, HealthEvent};
