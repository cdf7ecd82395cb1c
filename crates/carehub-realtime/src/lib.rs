//! # carehub-realtime
//!
//! Realtime synchronization layer for CareHub. Provides:
//!
//! - Connection health tracking with heartbeat and exponential reconnect backoff
//! - A channel registry multiplexing named topics over one shared transport
//! - Workspace activity feeds (snapshot plus live inserts, batched actor enrichment)
//! - Workspace presence rosters
//! - A bounded retry helper for subscription setup

pub mod activity;
pub mod channel;
pub mod connection;
pub mod metrics;
pub mod presence;
pub mod retry;
pub mod server;
pub mod transport;

pub use activity::feed::ActivityFeed;
pub use channel::registry::ChannelRegistry;
pub use connection::health::ConnectionHealthManager;
pub use presence::room::PresenceRoom;
pub use server::{Collaborators, RealtimeEngine};
