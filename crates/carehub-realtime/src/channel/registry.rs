//! Channel registry: at most one live handle per channel name.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use carehub_core::error::AppError;
use carehub_core::result::AppResult;

use crate::connection::ConnectionStatus;
use crate::metrics::EngineMetrics;
use crate::retry::RetryPolicy;
use crate::transport::RealtimeTransport;

use super::handle::{ChannelHandle, ChannelStatusEvent};

const STATUS_EVENT_BUFFER: usize = 256;

/// Unregisters a freshly created handle whose creator was cancelled before
/// the join settled, failing it so concurrent waiters return.
struct PendingJoin<'a> {
    channels: &'a DashMap<String, Arc<ChannelHandle>>,
    name: &'a str,
    handle: Arc<ChannelHandle>,
    armed: bool,
}

impl PendingJoin<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingJoin<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.handle.abandon();
        self.channels
            .remove_if(self.name, |_, current| Arc::ptr_eq(current, &self.handle));
        warn!(channel = %self.name, "Channel join cancelled before it settled");
    }
}

/// Registry of all live channels.
pub struct ChannelRegistry {
    transport: Arc<dyn RealtimeTransport>,
    /// Channel name → handle.
    channels: DashMap<String, Arc<ChannelHandle>>,
    retry: RetryPolicy,
    buffer_size: usize,
    status_events: broadcast::Sender<ChannelStatusEvent>,
    metrics: Arc<EngineMetrics>,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.channel_names())
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}

impl ChannelRegistry {
    /// Creates an empty registry over `transport`.
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        retry: RetryPolicy,
        buffer_size: usize,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let (status_events, _) = broadcast::channel(STATUS_EVENT_BUFFER);
        Self {
            transport,
            channels: DashMap::new(),
            retry,
            buffer_size,
            status_events,
            metrics,
        }
    }

    /// Returns the live handle for `name`, creating and joining it if absent.
    ///
    /// The first caller for a name performs the join; concurrent callers get
    /// the same handle once it settles. A closed handle is replaced.
    pub async fn get_or_create_channel(&self, name: &str) -> AppResult<Arc<ChannelHandle>> {
        if name.is_empty() {
            return Err(AppError::validation("Channel name must not be empty"));
        }

        let (handle, created) = match self.channels.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_closed() {
                    let handle = self.new_handle(name);
                    entry.insert(handle.clone());
                    (handle, true)
                } else {
                    (entry.get().clone(), false)
                }
            }
            Entry::Vacant(entry) => {
                let handle = self.new_handle(name);
                entry.insert(handle.clone());
                (handle, true)
            }
        };

        if created {
            EngineMetrics::inc(&self.metrics.channels_created);
            debug!(channel = %name, "Channel created");

            // Dropping this future mid-join must not leave a handle stuck in
            // `connecting` for later callers to wait on.
            let pending = PendingJoin {
                channels: &self.channels,
                name,
                handle: handle.clone(),
                armed: true,
            };
            let joined = handle.connect().await;
            pending.disarm();

            if let Err(e) = joined {
                self.channels
                    .remove_if(name, |_, current| Arc::ptr_eq(current, &handle));
                error!(channel = %name, error = %e, "Channel setup failed");
                return Err(e);
            }
            return Ok(handle);
        }

        handle.wait_settled().await;
        if handle.is_closed() {
            return Err(handle.last_error().unwrap_or_else(|| {
                AppError::service_unavailable(format!("Channel {name} failed to join"))
            }));
        }
        Ok(handle)
    }

    fn new_handle(&self, name: &str) -> Arc<ChannelHandle> {
        Arc::new(ChannelHandle::new(
            name,
            self.transport.clone(),
            self.retry,
            self.buffer_size,
            self.status_events.clone(),
            self.metrics.clone(),
        ))
    }

    /// Returns the handle for `name` without creating it.
    pub fn get(&self, name: &str) -> Option<Arc<ChannelHandle>> {
        self.channels.get(name).map(|h| h.value().clone())
    }

    /// Closes and removes the channel. Returns whether one was removed.
    pub async fn remove_channel(&self, name: &str) -> bool {
        let Some(handle) = self.get(name) else {
            return false;
        };

        handle.close().await;
        let removed = self
            .channels
            .remove_if(name, |_, current| Arc::ptr_eq(current, &handle))
            .is_some();

        if removed {
            EngineMetrics::inc(&self.metrics.channels_removed);
            info!(channel = %name, "Channel removed");
        }
        removed
    }

    /// Removes the channel only if no listener is attached to it.
    pub async fn release_channel(&self, name: &str) -> bool {
        match self.get(name) {
            Some(handle) if handle.attached_handler_count() == 0 => {
                self.remove_channel(name).await
            }
            Some(handle) => {
                debug!(
                    channel = %name,
                    listeners = handle.attached_handler_count(),
                    "Channel still in use, not released"
                );
                false
            }
            None => false,
        }
    }

    /// Closes and removes every channel.
    pub async fn remove_all_channels(&self) {
        let names = self.channel_names();
        for name in &names {
            self.remove_channel(name).await;
        }
        info!(count = names.len(), "All channels removed");
    }

    /// Re-joins every channel on a fresh transport subscription, keeping
    /// each handle and its listeners. Returns the number of failures.
    pub async fn resubscribe_all(&self) -> usize {
        let handles: Vec<Arc<ChannelHandle>> =
            self.channels.iter().map(|h| h.value().clone()).collect();
        EngineMetrics::inc(&self.metrics.resubscribe_passes);

        let mut failures = 0;
        for handle in &handles {
            if let Err(e) = handle.resubscribe().await {
                failures += 1;
                warn!(channel = %handle.name(), error = %e, "Channel resubscribe failed");
            }
        }

        info!(
            channels = handles.len(),
            failures, "Channel resubscription pass complete"
        );
        failures
    }

    /// Names of all registered channels, sorted.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Status of the channel, if registered.
    pub fn status(&self, name: &str) -> Option<ConnectionStatus> {
        self.channels.get(name).map(|h| h.status())
    }

    /// Number of registered channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Subscribes to status changes of every channel.
    pub fn subscribe_status(&self) -> broadcast::Receiver<ChannelStatusEvent> {
        self.status_events.subscribe()
    }
}
