//! Realtime engine metrics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Engine-level metrics counters.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Channels created through the registry
    pub channels_created: AtomicU64,
    /// Channels removed from the registry
    pub channels_removed: AtomicU64,
    /// Transport events fanned out to channel listeners
    pub events_received: AtomicU64,
    /// Heartbeat probes that succeeded
    pub heartbeats_ok: AtomicU64,
    /// Reconnect attempts scheduled by the health manager
    pub reconnect_attempts: AtomicU64,
    /// Full channel re-subscription passes
    pub resubscribe_passes: AtomicU64,
    /// Actor lookups sent to the profile directory
    pub actor_lookups: AtomicU64,
}

impl EngineMetrics {
    /// Create new zeroed metrics
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            channels_created: self.channels_created.load(Ordering::Relaxed),
            channels_removed: self.channels_removed.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            heartbeats_ok: self.heartbeats_ok.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            resubscribe_passes: self.resubscribe_passes.load(Ordering::Relaxed),
            actor_lookups: self.actor_lookups.load(Ordering::Relaxed),
        }
    }
}

/// Serializable metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Channels created
    pub channels_created: u64,
    /// Channels removed
    pub channels_removed: u64,
    /// Transport events fanned out
    pub events_received: u64,
    /// Successful heartbeat probes
    pub heartbeats_ok: u64,
    /// Scheduled reconnect attempts
    pub reconnect_attempts: u64,
    /// Re-subscription passes
    pub resubscribe_passes: u64,
    /// Profile directory lookups
    pub actor_lookups: u64,
}
