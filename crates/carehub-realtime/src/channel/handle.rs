//! One named channel multiplexed over the shared transport.
//!
//! A handle outlives the transport subscriptions behind it: a resubscribe
//! swaps the subscription while listeners, row-change filters and tracked
//! presence stay attached to the same handle.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use carehub_core::error::AppError;
use carehub_core::result::AppResult;

use crate::connection::ConnectionStatus;
use crate::metrics::EngineMetrics;
use crate::retry::{RetryPolicy, retry};
use crate::transport::{
    BroadcastMessage, ChannelEvent, JoinState, RealtimeTransport, RowChangeFilter, SubscriptionId,
    TransportSubscription,
};

/// Where a channel status change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOrigin {
    /// Join or resubscribe performed by the handle.
    Setup,
    /// Reported by the transport while joined.
    Transport,
    /// Requested locally (close, resubscribe start).
    Local,
}

/// Published whenever a channel's status changes.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStatusEvent {
    /// Channel name.
    pub name: String,
    /// New status.
    pub status: ConnectionStatus,
    /// Failure behind an `error` status.
    pub error: Option<AppError>,
    /// Source of the change.
    pub origin: StatusOrigin,
}

/// Identifies one tracker of a channel's presence, such as one open room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackId(u64);

#[derive(Debug, Clone)]
struct TrackedPresence {
    id: TrackId,
    key: String,
    payload: Value,
}

#[derive(Debug)]
struct Link {
    subscription: SubscriptionId,
    pump: JoinHandle<()>,
}

/// A named live topic.
pub struct ChannelHandle {
    name: String,
    transport: Arc<dyn RealtimeTransport>,
    retry: RetryPolicy,
    events: broadcast::Sender<ChannelEvent>,
    status: watch::Sender<ConnectionStatus>,
    status_events: broadcast::Sender<ChannelStatusEvent>,
    link: tokio::sync::Mutex<Option<Link>>,
    filters: Mutex<Vec<RowChangeFilter>>,
    /// Trackers in track order; the last one is what the transport holds.
    tracked: Mutex<Vec<TrackedPresence>>,
    next_track_id: AtomicU64,
    listeners: Arc<AtomicUsize>,
    closed: AtomicBool,
    last_error: Mutex<Option<AppError>>,
    metrics: Arc<EngineMetrics>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("name", &self.name)
            .field("status", &self.status())
            .field("listeners", &self.attached_handler_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ChannelHandle {
    /// Creates an unjoined handle in the `connecting` state.
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn RealtimeTransport>,
        retry: RetryPolicy,
        buffer_size: usize,
        status_events: broadcast::Sender<ChannelStatusEvent>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let (events, _) = broadcast::channel(buffer_size.max(1));
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        Self {
            name: name.into(),
            transport,
            retry,
            events,
            status,
            status_events,
            link: tokio::sync::Mutex::new(None),
            filters: Mutex::new(Vec::new()),
            tracked: Mutex::new(Vec::new()),
            next_track_id: AtomicU64::new(1),
            listeners: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            last_error: Mutex::new(None),
            metrics,
        }
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Watches status changes.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Number of live [`ChannelListener`]s.
    pub fn attached_handler_count(&self) -> usize {
        self.listeners.load(Ordering::SeqCst)
    }

    /// Most recent failure.
    pub fn last_error(&self) -> Option<AppError> {
        lock(&self.last_error).clone()
    }

    /// Whether the handle was closed or failed its initial join.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Attaches a listener. Events are delivered in transport order.
    pub fn listen(&self) -> ChannelListener {
        self.listeners.fetch_add(1, Ordering::SeqCst);
        ChannelListener {
            name: self.name.clone(),
            receiver: self.events.subscribe(),
            guard: ListenerGuard(self.listeners.clone()),
        }
    }

    /// Waits until the handle leaves `connecting`.
    pub async fn wait_settled(&self) -> ConnectionStatus {
        let mut rx = self.status.subscribe();
        match rx.wait_for(|s| *s != ConnectionStatus::Connecting).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        }
    }

    /// Joins the topic if not joined yet. Failures are retried by the
    /// handle's [`RetryPolicy`]; a failed initial join closes the handle.
    pub async fn connect(self: &Arc<Self>) -> AppResult<()> {
        let mut link = self.link.lock().await;
        if link.is_some() {
            return Ok(());
        }
        if self.is_closed() {
            return Err(AppError::service_unavailable(format!(
                "Channel {} is closed",
                self.name
            )));
        }

        match self.establish(&mut link).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.closed.store(true, Ordering::SeqCst);
                self.set_status(ConnectionStatus::Error, Some(e.clone()), StatusOrigin::Setup);
                Err(e)
            }
        }
    }

    /// Leaves the current transport subscription and joins a fresh one,
    /// keeping listeners, filters and tracked presence.
    pub async fn resubscribe(self: &Arc<Self>) -> AppResult<()> {
        let mut link = self.link.lock().await;
        if self.is_closed() {
            return Ok(());
        }

        if let Some(old) = link.take() {
            old.pump.abort();
            if let Err(e) = self.transport.leave(old.subscription).await {
                debug!(channel = %self.name, error = %e, "Leaving stale subscription failed");
            }
        }
        self.set_status(ConnectionStatus::Connecting, None, StatusOrigin::Local);

        let result = self.establish(&mut link).await;
        if let Err(e) = &result {
            self.set_status(ConnectionStatus::Error, Some(e.clone()), StatusOrigin::Setup);
        }
        result
    }

    /// Fails a handle whose initial join was abandoned mid-flight.
    pub(crate) fn abandon(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut link) = self.link.try_lock() {
            if let Some(old) = link.take() {
                old.pump.abort();
                let transport = self.transport.clone();
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    runtime.spawn(async move {
                        let _ = transport.leave(old.subscription).await;
                    });
                }
            }
        }
        let error =
            AppError::service_unavailable(format!("Join of {} was cancelled", self.name));
        self.set_status(ConnectionStatus::Error, Some(error), StatusOrigin::Setup);
    }

    /// Leaves the topic and marks the handle closed. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let old = self.link.lock().await.take();
        if let Some(old) = old {
            old.pump.abort();
            if let Err(e) = self.transport.leave(old.subscription).await {
                warn!(channel = %self.name, error = %e, "Failed to leave channel");
            }
        }
        lock(&self.tracked).clear();
        self.set_status(ConnectionStatus::Disconnected, None, StatusOrigin::Local);
        debug!(channel = %self.name, "Channel closed");
    }

    /// Registers a row-change filter; it is re-registered on every resubscribe.
    pub async fn listen_row_changes(&self, filter: RowChangeFilter) -> AppResult<()> {
        {
            let mut filters = lock(&self.filters);
            if filters.contains(&filter) {
                return Ok(());
            }
            filters.push(filter.clone());
        }

        let link = self.link.lock().await;
        match link.as_ref() {
            Some(link) => {
                self.transport
                    .listen_row_changes(link.subscription, filter)
                    .await
            }
            None => Ok(()),
        }
    }

    /// Allocates a tracker id for [`ChannelHandle::track`].
    pub fn track_id(&self) -> TrackId {
        TrackId(self.next_track_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Tracks presence for tracker `id` under `key`. The transport holds one
    /// presence per subscription: the most recent track of any tracker.
    pub async fn track(&self, id: TrackId, key: &str, payload: Value) -> AppResult<()> {
        {
            let mut tracked = lock(&self.tracked);
            tracked.retain(|t| t.id != id);
            tracked.push(TrackedPresence {
                id,
                key: key.to_string(),
                payload: payload.clone(),
            });
        }
        let subscription = self.joined_subscription().await?;
        self.transport.track(subscription, key, payload).await
    }

    /// Drops tracker `id`. The transport presence is removed only with the
    /// last tracker; otherwise the latest remaining tracker is re-tracked.
    pub async fn untrack(&self, id: TrackId) -> AppResult<()> {
        let (was_current, next) = {
            let mut tracked = lock(&self.tracked);
            let Some(pos) = tracked.iter().position(|t| t.id == id) else {
                return Ok(());
            };
            let was_current = pos + 1 == tracked.len();
            tracked.remove(pos);
            (was_current, tracked.last().cloned())
        };

        let link = self.link.lock().await;
        let Some(link) = link.as_ref() else {
            return Ok(());
        };
        match next {
            None => self.transport.untrack(link.subscription).await,
            Some(next) if was_current => {
                debug!(channel = %self.name, key = %next.key, "Re-tracking remaining presence");
                self.transport
                    .track(link.subscription, &next.key, next.payload)
                    .await
            }
            Some(_) => Ok(()),
        }
    }

    /// Number of live presence trackers.
    pub fn tracker_count(&self) -> usize {
        lock(&self.tracked).len()
    }

    /// Sends a broadcast to the other subscribers of the topic.
    pub async fn send_broadcast(&self, event: &str, payload: Value) -> AppResult<()> {
        let subscription = self.joined_subscription().await?;
        self.transport
            .broadcast(
                subscription,
                BroadcastMessage {
                    event: event.to_string(),
                    payload,
                },
            )
            .await
    }

    async fn joined_subscription(&self) -> AppResult<SubscriptionId> {
        self.link
            .lock()
            .await
            .as_ref()
            .map(|l| l.subscription)
            .ok_or_else(|| {
                AppError::service_unavailable(format!("Channel {} is not joined", self.name))
            })
    }

    async fn establish(self: &Arc<Self>, link: &mut Option<Link>) -> AppResult<()> {
        let transport = &self.transport;
        let name = self.name.as_str();
        let subscription = retry(&self.retry, &format!("join {name}"), move || {
            transport.join(name)
        })
        .await?;

        if let Err(e) = self.restore(&subscription).await {
            if let Err(leave_err) = self.transport.leave(subscription.id).await {
                debug!(channel = %self.name, error = %leave_err, "Cleanup leave failed");
            }
            return Err(e);
        }

        let TransportSubscription { id, events, state } = subscription;
        let initial = *state.borrow();
        let pump = tokio::spawn(pump(Arc::downgrade(self), events, state));
        *link = Some(Link {
            subscription: id,
            pump,
        });

        info!(channel = %self.name, subscription = %id, "Channel joined");
        self.set_status(ConnectionStatus::from(initial), None, StatusOrigin::Setup);
        Ok(())
    }

    /// Re-registers filters and tracked presence on a fresh subscription.
    async fn restore(&self, subscription: &TransportSubscription) -> AppResult<()> {
        let filters = lock(&self.filters).clone();
        for filter in filters {
            self.transport
                .listen_row_changes(subscription.id, filter)
                .await?;
        }

        let tracked = lock(&self.tracked).last().cloned();
        if let Some(TrackedPresence { key, payload, .. }) = tracked {
            if let Err(e) = self.transport.track(subscription.id, &key, payload).await {
                warn!(channel = %self.name, error = %e, "Failed to restore tracked presence");
            }
        }
        Ok(())
    }

    fn dispatch(&self, event: ChannelEvent) {
        EngineMetrics::inc(&self.metrics.events_received);
        // No receivers is fine: the channel may have no listeners yet.
        let _ = self.events.send(event);
    }

    fn apply_join_state(&self, state: JoinState) {
        let status = ConnectionStatus::from(state);
        let error = (status == ConnectionStatus::Error)
            .then(|| AppError::transport(format!("CHANNEL_ERROR on {}", self.name)));
        if status != ConnectionStatus::Connected {
            warn!(channel = %self.name, state = ?state, "Transport reported channel state change");
        }
        self.set_status(status, error, StatusOrigin::Transport);
    }

    fn set_status(&self, status: ConnectionStatus, error: Option<AppError>, origin: StatusOrigin) {
        if let Some(e) = &error {
            *lock(&self.last_error) = Some(e.clone());
        }

        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });

        if changed {
            let _ = self.status_events.send(ChannelStatusEvent {
                name: self.name.clone(),
                status,
                error,
                origin,
            });
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.pump.abort();
        }
    }
}

/// Forwards one subscription's events and join-state changes to its handle.
async fn pump(
    handle: Weak<ChannelHandle>,
    mut events: mpsc::Receiver<ChannelEvent>,
    mut state: watch::Receiver<JoinState>,
) {
    loop {
        tokio::select! {
            biased;
            event = events.recv() => {
                let Some(handle) = handle.upgrade() else { break };
                match event {
                    Some(event) => handle.dispatch(event),
                    None => {
                        let last = *state.borrow();
                        handle.apply_join_state(last);
                        break;
                    }
                }
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                let Some(handle) = handle.upgrade() else { break };
                handle.apply_join_state(current);
            }
        }
    }
}

#[derive(Debug)]
struct ListenerGuard(Arc<AtomicUsize>);

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An attached event listener. Dropping it detaches.
#[derive(Debug)]
pub struct ChannelListener {
    name: String,
    receiver: broadcast::Receiver<ChannelEvent>,
    guard: ListenerGuard,
}

impl ChannelListener {
    /// Receives the next event. Returns `None` once the handle is gone.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.name, skipped, "Channel listener lagged, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Returns a queued event without waiting.
    pub fn try_recv(&mut self) -> Option<ChannelEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(channel = %self.name, skipped, "Channel listener lagged, events dropped");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Number of listeners currently attached to the same handle.
    pub fn attached(&self) -> usize {
        self.guard.0.load(Ordering::SeqCst)
    }
}
