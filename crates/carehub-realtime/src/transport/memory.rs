//! In-memory transport for single-process use and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use carehub_core::error::AppError;
use carehub_core::result::AppResult;

use super::events::{
    BroadcastMessage, ChannelEvent, JoinState, PresenceEvent, RowChange, RowChangeFilter,
};
use super::{RealtimeTransport, SubscriptionId, TransportSubscription};

/// One joined subscription.
#[derive(Debug)]
struct MemorySubscription {
    topic: String,
    filters: Vec<RowChangeFilter>,
    events: mpsc::Sender<ChannelEvent>,
    state: watch::Sender<JoinState>,
    tracked_key: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    subscriptions: HashMap<SubscriptionId, MemorySubscription>,
    /// Topic → presence key → (tracking subscription, payload).
    presence: HashMap<String, BTreeMap<String, Vec<(SubscriptionId, Value)>>>,
    failing_joins: u32,
    reject_joins: bool,
    joins: u64,
}

/// In-memory realtime transport.
///
/// Row changes are matched against each subscription's filters; presence
/// changes are echoed to every subscriber of the topic as a join/leave
/// followed by a full sync. Broadcasts are not echoed to the sender.
#[derive(Debug)]
pub struct MemoryTransport {
    buffer_size: usize,
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    /// Creates a transport whose per-subscription queues hold `buffer_size` events.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes the next `count` joins fail with a channel error.
    pub fn fail_next_joins(&self, count: u32) {
        self.lock().failing_joins = count;
    }

    /// Rejects every join until called again with `false`.
    pub fn reject_joins(&self, reject: bool) {
        self.lock().reject_joins = reject;
    }

    /// Number of successful joins so far.
    pub fn join_count(&self) -> u64 {
        self.lock().joins
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscription_count(&self, topic: &str) -> usize {
        self.lock()
            .subscriptions
            .values()
            .filter(|s| s.topic == topic)
            .count()
    }

    /// Delivers a row change to every joined subscription with a matching
    /// filter. Returns the number of subscriptions reached.
    pub fn publish_row_change(&self, change: RowChange) -> usize {
        let state = self.lock();
        let mut delivered = 0;
        for (id, sub) in &state.subscriptions {
            if sub.filters.iter().any(|f| f.matches(&change))
                && deliver(id, sub, ChannelEvent::RowChange(change.clone()))
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// Shorthand for publishing an INSERT of `row` into `schema.table`.
    pub fn insert_row(&self, schema: &str, table: &str, row: Value) -> usize {
        self.publish_row_change(RowChange::insert(schema, table, row))
    }

    /// Delivers `event` to every joined subscription of `topic`.
    pub fn emit(&self, topic: &str, event: ChannelEvent) -> usize {
        let state = self.lock();
        state
            .subscriptions
            .iter()
            .filter(|(_, s)| s.topic == topic)
            .filter(|(id, s)| deliver(id, s, event.clone()))
            .count()
    }

    /// Marks every subscription as errored, as a dropped socket would.
    pub fn drop_connection(&self) {
        let state = self.lock();
        for sub in state.subscriptions.values() {
            sub.state.send_replace(JoinState::Errored);
        }
        debug!(
            subscriptions = state.subscriptions.len(),
            "Memory transport connection dropped"
        );
    }

    fn presence_state(state: &MemoryState, topic: &str) -> HashMap<String, Vec<Value>> {
        state
            .presence
            .get(topic)
            .map(|keys| {
                keys.iter()
                    .map(|(key, metas)| (key.clone(), metas.iter().map(|(_, v)| v.clone()).collect()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn broadcast_presence(state: &MemoryState, topic: &str, event: PresenceEvent) {
        let sync = PresenceEvent::Sync {
            state: Self::presence_state(state, topic),
        };
        for (id, sub) in state.subscriptions.iter().filter(|(_, s)| s.topic == topic) {
            deliver(id, sub, ChannelEvent::Presence(event.clone()));
            deliver(id, sub, ChannelEvent::Presence(sync.clone()));
        }
    }

    /// Removes the presence tracked by `subscription` and announces the leave.
    fn remove_presence(state: &mut MemoryState, subscription: SubscriptionId) {
        let Some(sub) = state.subscriptions.get_mut(&subscription) else {
            return;
        };
        let Some(key) = sub.tracked_key.take() else {
            return;
        };
        let topic = sub.topic.clone();

        let mut left = Vec::new();
        if let Some(keys) = state.presence.get_mut(&topic) {
            if let Some(metas) = keys.get_mut(&key) {
                metas.retain(|(owner, payload)| {
                    if *owner == subscription {
                        left.push(payload.clone());
                        false
                    } else {
                        true
                    }
                });
                if metas.is_empty() {
                    keys.remove(&key);
                }
            }
        }

        if !left.is_empty() {
            Self::broadcast_presence(
                state,
                &topic,
                PresenceEvent::Leave {
                    key,
                    left_presences: left,
                },
            );
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Pushes an event onto a subscription queue. Returns whether it was queued.
fn deliver(id: &SubscriptionId, sub: &MemorySubscription, event: ChannelEvent) -> bool {
    if *sub.state.borrow() != JoinState::Joined {
        return false;
    }
    match sub.events.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(subscription = %id, topic = %sub.topic, "Subscription queue full, dropping event");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[async_trait]
impl RealtimeTransport for MemoryTransport {
    async fn join(&self, topic: &str) -> AppResult<TransportSubscription> {
        let mut state = self.lock();

        if state.reject_joins {
            return Err(AppError::transport(format!("CHANNEL_ERROR joining {topic}")));
        }
        if state.failing_joins > 0 {
            state.failing_joins -= 1;
            return Err(AppError::transport(format!("CHANNEL_ERROR joining {topic}")));
        }

        let id = Uuid::new_v4();
        let (events_tx, events_rx) = mpsc::channel(self.buffer_size);
        let (state_tx, state_rx) = watch::channel(JoinState::Joined);

        state.subscriptions.insert(
            id,
            MemorySubscription {
                topic: topic.to_string(),
                filters: Vec::new(),
                events: events_tx,
                state: state_tx,
                tracked_key: None,
            },
        );
        state.joins += 1;

        debug!(subscription = %id, topic = %topic, "Memory transport joined topic");

        Ok(TransportSubscription {
            id,
            events: events_rx,
            state: state_rx,
        })
    }

    async fn leave(&self, subscription: SubscriptionId) -> AppResult<()> {
        let mut state = self.lock();
        Self::remove_presence(&mut state, subscription);

        match state.subscriptions.remove(&subscription) {
            Some(sub) => {
                sub.state.send_replace(JoinState::Closed);
                debug!(subscription = %subscription, topic = %sub.topic, "Memory transport left topic");
                Ok(())
            }
            None => Err(AppError::not_found(format!(
                "Unknown subscription {subscription}"
            ))),
        }
    }

    async fn listen_row_changes(
        &self,
        subscription: SubscriptionId,
        filter: RowChangeFilter,
    ) -> AppResult<()> {
        let mut state = self.lock();
        let sub = state
            .subscriptions
            .get_mut(&subscription)
            .ok_or_else(|| AppError::not_found(format!("Unknown subscription {subscription}")))?;

        if !sub.filters.contains(&filter) {
            sub.filters.push(filter);
        }
        Ok(())
    }

    async fn track(
        &self,
        subscription: SubscriptionId,
        key: &str,
        payload: Value,
    ) -> AppResult<()> {
        let mut state = self.lock();
        let topic = {
            let sub = state.subscriptions.get(&subscription).ok_or_else(|| {
                AppError::not_found(format!("Unknown subscription {subscription}"))
            })?;
            sub.topic.clone()
        };

        // Re-tracking under a different key is a leave followed by a join.
        let previous_key = state
            .subscriptions
            .get(&subscription)
            .and_then(|s| s.tracked_key.clone());
        if previous_key.as_deref().is_some_and(|k| k != key) {
            Self::remove_presence(&mut state, subscription);
        }

        let metas = state
            .presence
            .entry(topic.clone())
            .or_default()
            .entry(key.to_string())
            .or_default();
        metas.retain(|(owner, _)| *owner != subscription);
        metas.push((subscription, payload.clone()));

        if let Some(sub) = state.subscriptions.get_mut(&subscription) {
            sub.tracked_key = Some(key.to_string());
        }

        Self::broadcast_presence(
            &state,
            &topic,
            PresenceEvent::Join {
                key: key.to_string(),
                new_presences: vec![payload],
            },
        );
        Ok(())
    }

    async fn untrack(&self, subscription: SubscriptionId) -> AppResult<()> {
        let mut state = self.lock();
        if !state.subscriptions.contains_key(&subscription) {
            return Err(AppError::not_found(format!(
                "Unknown subscription {subscription}"
            )));
        }
        Self::remove_presence(&mut state, subscription);
        Ok(())
    }

    async fn broadcast(
        &self,
        subscription: SubscriptionId,
        message: BroadcastMessage,
    ) -> AppResult<()> {
        let state = self.lock();
        let topic = state
            .subscriptions
            .get(&subscription)
            .map(|s| s.topic.clone())
            .ok_or_else(|| AppError::not_found(format!("Unknown subscription {subscription}")))?;

        for (id, sub) in state
            .subscriptions
            .iter()
            .filter(|(id, s)| s.topic == topic && **id != subscription)
        {
            deliver(id, sub, ChannelEvent::Broadcast(message.clone()));
        }
        Ok(())
    }
}
