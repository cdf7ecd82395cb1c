//! The shared realtime transport the channel registry multiplexes over.
//!
//! The transport is an external collaborator: it joins topics, forwards
//! row changes, broadcasts, and presence signals, and reports each
//! subscription's join lifecycle. [`memory::MemoryTransport`] is the
//! in-process implementation used by tests and the local sandbox.

pub mod events;
pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use carehub_core::result::AppResult;

pub use events::{
    BroadcastMessage, ChannelEvent, JoinState, PresenceEvent, RowChange, RowChangeFilter,
    RowChangeKind,
};
pub use memory::MemoryTransport;

/// Identifier of one transport subscription (one join of one topic).
pub type SubscriptionId = Uuid;

/// A joined topic: a bounded event queue plus the join lifecycle.
#[derive(Debug)]
pub struct TransportSubscription {
    /// Subscription identifier used for later operations.
    pub id: SubscriptionId,
    /// Events in transport delivery order.
    pub events: mpsc::Receiver<ChannelEvent>,
    /// Current join state.
    pub state: watch::Receiver<JoinState>,
}

/// Realtime transport operations.
#[async_trait]
pub trait RealtimeTransport: Send + Sync + std::fmt::Debug + 'static {
    /// Joins `topic`. Resolves once the join is acknowledged or has failed.
    async fn join(&self, topic: &str) -> AppResult<TransportSubscription>;

    /// Leaves a previously joined subscription.
    async fn leave(&self, subscription: SubscriptionId) -> AppResult<()>;

    /// Starts delivering row changes matching `filter` to `subscription`.
    async fn listen_row_changes(
        &self,
        subscription: SubscriptionId,
        filter: RowChangeFilter,
    ) -> AppResult<()>;

    /// Tracks a presence payload under `key`, replacing any payload this
    /// subscription tracked before.
    async fn track(&self, subscription: SubscriptionId, key: &str, payload: Value)
    -> AppResult<()>;

    /// Stops tracking this subscription's presence.
    async fn untrack(&self, subscription: SubscriptionId) -> AppResult<()>;

    /// Sends a broadcast message to every subscriber of the topic.
    async fn broadcast(
        &self,
        subscription: SubscriptionId,
        message: BroadcastMessage,
    ) -> AppResult<()>;
}
