//! Liveness probing while connected.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use carehub_core::error::AppError;
use carehub_core::result::AppResult;

use super::health::ConnectionHealthManager;

/// Floor applied to the heartbeat interval; `interval_at` rejects zero.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// A minimal round-trip against the backend, used as the liveness check.
#[async_trait]
pub trait HealthProbe: Send + Sync + std::fmt::Debug + 'static {
    /// Performs one probe.
    async fn probe(&self) -> AppResult<()>;
}

/// Probe whose outcome is switched by the caller.
#[derive(Debug)]
pub struct StaticProbe {
    healthy: AtomicBool,
    calls: AtomicU32,
}

impl StaticProbe {
    /// Creates a probe that starts healthy or failing.
    pub fn new(healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
            calls: AtomicU32::new(0),
        }
    }

    /// Switches the probe outcome.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Number of probes performed.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for StaticProbe {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl HealthProbe for StaticProbe {
    async fn probe(&self) -> AppResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::transport("Liveness probe failed"))
        }
    }
}

/// Runs the heartbeat loop until a probe fails or the manager is gone.
///
/// The first probe fires one full `interval` after the loop starts. A
/// failed probe reports `disconnected` and ends the loop; the manager
/// starts a fresh loop on the next `connected`.
pub(crate) async fn run_heartbeat(
    manager: Weak<ConnectionHealthManager>,
    probe: Arc<dyn HealthProbe>,
    interval: Duration,
) {
    let interval = interval.max(MIN_HEARTBEAT_INTERVAL);
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let result = probe.probe().await;

        let Some(manager) = manager.upgrade() else {
            break;
        };

        match result {
            Ok(()) => {
                manager.record_heartbeat();
                debug!("Heartbeat probe succeeded");
            }
            Err(e) => {
                warn!(error = %e, "Heartbeat probe failed");
                manager.disconnected(Some(e));
                break;
            }
        }
    }

    debug!("Heartbeat loop ended");
}
