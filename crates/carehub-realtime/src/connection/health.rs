//! Connection health manager: the status machine, its heartbeat and the
//! reconnect scheduler.
//!
//! Every failure source (heartbeat probe, channel error, caller report)
//! goes through [`ConnectionHealthManager::disconnected`] or
//! [`ConnectionHealthManager::error`], so recovery is uniform. Observers
//! receive [`HealthEvent`]s in transition order.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use carehub_core::config::RealtimeConfig;
use carehub_core::error::AppError;
use carehub_core::result::AppResult;

use crate::metrics::EngineMetrics;

use super::heartbeat::{HealthProbe, run_heartbeat};
use super::status::{ConnectionState, ConnectionStatus, HealthEvent};

const EVENT_BUFFER: usize = 64;

/// Timer settings for the health manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSettings {
    /// Interval between liveness probes while connected.
    pub heartbeat_interval: Duration,
    /// Maximum scheduled reconnect attempts.
    pub max_attempts: u32,
    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,
}

impl From<&RealtimeConfig> for HealthSettings {
    fn from(config: &RealtimeConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            max_attempts: config.reconnect.max_attempts,
            base_delay: config.reconnect.base_delay(),
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self::from(&RealtimeConfig::default())
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: ConnectionState,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    /// Bumped whenever pending timers or in-flight attempts are superseded.
    generation: u64,
    /// Set after a failure or forced reconnect; cleared when `Reconnected` fires.
    recovering: bool,
    /// Consecutive recoveries whose channel resubscribe pass failed. Carried
    /// into `reconnect_attempts` on `connected` so the budget stays bounded.
    resubscribe_failures: u32,
}

/// Tracks link health for one engine instance.
pub struct ConnectionHealthManager {
    probe: Arc<dyn HealthProbe>,
    settings: HealthSettings,
    inner: Mutex<Inner>,
    events: broadcast::Sender<HealthEvent>,
    metrics: Arc<EngineMetrics>,
}

impl std::fmt::Debug for ConnectionHealthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHealthManager")
            .field("settings", &self.settings)
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionHealthManager {
    /// Creates a manager in the `disconnected` state.
    pub fn new(
        settings: HealthSettings,
        probe: Arc<dyn HealthProbe>,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            probe,
            settings,
            inner: Mutex::new(Inner::default()),
            events,
            metrics,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribes to health events.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.lock().state.status
    }

    /// Snapshot of the full state.
    pub fn state(&self) -> ConnectionState {
        self.lock().state.clone()
    }

    /// Timer settings in use.
    pub fn settings(&self) -> HealthSettings {
        self.settings
    }

    /// Backoff before reconnect attempt `attempt` (1-based):
    /// `base_delay * 2^(attempt - 1)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.settings.base_delay.saturating_mul(factor)
    }

    /// Reports that a connection attempt started.
    pub fn connecting(self: &Arc<Self>) -> bool {
        let mut inner = self.lock();
        self.transition(&mut inner, ConnectionStatus::Connecting)
    }

    /// Reports that the connection is established.
    pub fn connected(self: &Arc<Self>) -> bool {
        let mut inner = self.lock();
        self.enter_connected(&mut inner)
    }

    /// Reports a lost connection.
    pub fn disconnected(self: &Arc<Self>, err: Option<AppError>) -> bool {
        let mut inner = self.lock();
        self.enter_failure(&mut inner, ConnectionStatus::Disconnected, err)
    }

    /// Reports a connection error.
    pub fn error(self: &Arc<Self>, err: AppError) -> bool {
        let mut inner = self.lock();
        self.enter_failure(&mut inner, ConnectionStatus::Error, Some(err))
    }

    /// Reports that channels could not be re-joined after a recovery. The
    /// connection goes to `error` and the next reconnect re-runs the pass;
    /// repeated failures consume the same attempt budget as probe failures.
    pub fn subscriptions_failed(self: &Arc<Self>, err: AppError) -> bool {
        let mut inner = self.lock();
        inner.resubscribe_failures += 1;
        warn!(
            failures = inner.resubscribe_failures,
            error = %err,
            "Channel resubscription failed after reconnect"
        );
        self.enter_failure(&mut inner, ConnectionStatus::Error, Some(err))
    }

    /// Reports a fully successful resubscribe pass.
    pub fn subscriptions_restored(&self) {
        let mut inner = self.lock();
        inner.resubscribe_failures = 0;
        if inner.state.status == ConnectionStatus::Connected {
            inner.state.reconnect_attempts = 0;
        }
    }

    /// Initial connect: enters `connecting`, probes once, and settles in
    /// `connected` or on the failure path.
    pub async fn connect(self: &Arc<Self>) -> ConnectionStatus {
        let generation = {
            let mut inner = self.lock();
            if inner.state.status == ConnectionStatus::Connected {
                return ConnectionStatus::Connected;
            }
            self.transition(&mut inner, ConnectionStatus::Connecting);
            Self::abort(&mut inner.reconnect);
            inner.generation += 1;
            inner.generation
        };

        let result = self.probe.probe().await;
        self.finish_attempt(generation, result)
    }

    /// Resets the attempt counter and re-probes immediately, cancelling any
    /// pending reconnect. This is the only way out of an exhausted `error`.
    pub async fn force_reconnect(self: &Arc<Self>) -> ConnectionStatus {
        let generation = {
            let mut inner = self.lock();
            Self::abort(&mut inner.reconnect);
            Self::abort(&mut inner.heartbeat);
            inner.generation += 1;
            inner.state.reconnect_attempts = 0;
            inner.resubscribe_failures = 0;
            inner.recovering = true;
            if inner.state.status != ConnectionStatus::Connected {
                self.transition(&mut inner, ConnectionStatus::Connecting);
            }
            info!(status = %inner.state.status, "Forced reconnect requested");
            inner.generation
        };

        let result = self.probe.probe().await;
        self.finish_attempt(generation, result)
    }

    /// Cancels all timers. Status is left as observed; counters are reset.
    pub fn destroy(&self) {
        let mut inner = self.lock();
        Self::abort(&mut inner.heartbeat);
        Self::abort(&mut inner.reconnect);
        inner.generation += 1;
        inner.state.reconnect_attempts = 0;
        inner.state.last_error = None;
        inner.recovering = false;
        inner.resubscribe_failures = 0;
        info!(status = %inner.state.status, "Connection health manager destroyed");
    }

    pub(crate) fn record_heartbeat(&self) {
        EngineMetrics::inc(&self.metrics.heartbeats_ok);
    }

    fn abort(task: &mut Option<JoinHandle<()>>) {
        if let Some(handle) = task.take() {
            handle.abort();
        }
    }

    /// Applies a status change if the edge is allowed and notifies observers.
    fn transition(&self, inner: &mut Inner, to: ConnectionStatus) -> bool {
        let from = inner.state.status;
        if from == to {
            return true;
        }
        if !from.can_transition_to(to) {
            warn!(from = %from, to = %to, "Rejected connection status transition");
            return false;
        }

        inner.state.status = to;
        debug!(from = %from, to = %to, "Connection status changed");
        let _ = self.events.send(HealthEvent::StatusChanged { from, to });
        true
    }

    fn enter_connected(self: &Arc<Self>, inner: &mut Inner) -> bool {
        if inner.state.status == ConnectionStatus::Connected {
            if inner.heartbeat.is_none() {
                self.start_heartbeat(inner);
            }
            if std::mem::take(&mut inner.recovering) {
                let _ = self.events.send(HealthEvent::Reconnected);
            }
            return true;
        }

        if !self.transition(inner, ConnectionStatus::Connected) {
            return false;
        }

        Self::abort(&mut inner.reconnect);
        inner.state.reconnect_attempts = inner.resubscribe_failures;
        inner.state.last_connected_at = Some(Utc::now());
        inner.state.last_error = None;
        self.start_heartbeat(inner);

        if std::mem::take(&mut inner.recovering) {
            info!("Connection re-established");
            let _ = self.events.send(HealthEvent::Reconnected);
        } else {
            info!("Connection established");
        }
        true
    }

    fn enter_failure(
        self: &Arc<Self>,
        inner: &mut Inner,
        target: ConnectionStatus,
        err: Option<AppError>,
    ) -> bool {
        let current = inner.state.status;
        if let Some(e) = err {
            inner.state.last_error = Some(e);
        }
        Self::abort(&mut inner.heartbeat);
        inner.recovering = true;

        // `error` is never downgraded to `disconnected`.
        let failure = if current == ConnectionStatus::Error {
            ConnectionStatus::Error
        } else {
            target
        };

        if inner.reconnect.is_some() {
            return self.transition(inner, failure);
        }

        let exhausted = inner.state.reconnect_attempts >= self.settings.max_attempts;
        let next = if exhausted {
            ConnectionStatus::Error
        } else {
            failure
        };

        if !self.transition(inner, next) {
            return false;
        }

        if exhausted {
            if inner.state.last_error.is_none() {
                inner.state.last_error = Some(AppError::service_unavailable(
                    "Reconnection attempts exhausted",
                ));
            }
            error!(
                attempts = inner.state.reconnect_attempts,
                "Reconnection attempts exhausted; waiting for a forced reconnect"
            );
            return true;
        }

        inner.state.reconnect_attempts += 1;
        let attempt = inner.state.reconnect_attempts;
        let delay = self.backoff_delay(attempt);
        self.schedule_reconnect(inner, delay);

        EngineMetrics::inc(&self.metrics.reconnect_attempts);
        warn!(
            attempt,
            max_attempts = self.settings.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Connection lost, reconnect scheduled"
        );
        let _ = self.events.send(HealthEvent::Reconnecting { attempt, delay });
        true
    }

    fn start_heartbeat(self: &Arc<Self>, inner: &mut Inner) {
        Self::abort(&mut inner.heartbeat);
        inner.heartbeat = Some(tokio::spawn(run_heartbeat(
            Arc::downgrade(self),
            self.probe.clone(),
            self.settings.heartbeat_interval,
        )));
    }

    fn schedule_reconnect(self: &Arc<Self>, inner: &mut Inner, delay: Duration) {
        Self::abort(&mut inner.reconnect);
        inner.generation += 1;
        let generation = inner.generation;
        let manager = Arc::downgrade(self);

        inner.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = manager.upgrade() {
                manager.run_reconnect_attempt(generation).await;
            }
        }));
    }

    async fn run_reconnect_attempt(self: &Arc<Self>, generation: u64) {
        {
            let mut inner = self.lock();
            if inner.generation != generation {
                return;
            }
            // Detach: this task is now the attempt and must not abort itself.
            inner.reconnect = None;
            if !self.transition(&mut inner, ConnectionStatus::Connecting) {
                return;
            }
            info!(
                attempt = inner.state.reconnect_attempts,
                "Attempting reconnect"
            );
        }

        let result = self.probe.probe().await;
        self.finish_attempt(generation, result);
    }

    fn finish_attempt(self: &Arc<Self>, generation: u64, result: AppResult<()>) -> ConnectionStatus {
        let mut inner = self.lock();
        if inner.generation != generation {
            debug!("Discarding superseded connection attempt");
            return inner.state.status;
        }

        match result {
            Ok(()) => {
                self.enter_connected(&mut inner);
            }
            Err(e) => {
                warn!(error = %e, "Connection attempt failed");
                self.enter_failure(&mut inner, ConnectionStatus::Disconnected, Some(e));
            }
        }
        inner.state.status
    }
}

impl Drop for ConnectionHealthManager {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        Self::abort(&mut inner.heartbeat);
        Self::abort(&mut inner.reconnect);
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::broadcast::error::TryRecvError;

    use super::super::heartbeat::StaticProbe;
    use super::*;
    use ConnectionStatus::*;

    fn manager(probe: Arc<StaticProbe>) -> Arc<ConnectionHealthManager> {
        ConnectionHealthManager::new(
            HealthSettings::default(),
            probe,
            Arc::new(EngineMetrics::new()),
        )
    }

    fn drain(rx: &mut broadcast::Receiver<HealthEvent>) -> Vec<HealthEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(ev) => events.push(ev),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
        events
    }

    fn statuses(events: &[HealthEvent]) -> Vec<(ConnectionStatus, ConnectionStatus)> {
        events
            .iter()
            .filter_map(|e| match e {
                HealthEvent::StatusChanged { from, to } => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_starts_heartbeat() {
        let probe = Arc::new(StaticProbe::new(true));
        let m = manager(probe.clone());

        assert_eq!(m.connect().await, Connected);
        let state = m.state();
        assert!(state.last_connected_at.is_some());
        assert_eq!(state.reconnect_attempts, 0);

        tokio::time::sleep(Duration::from_secs(95)).await;
        // initial connect + probes at 30s, 60s, 90s
        assert_eq!(probe.calls(), 4);
        assert_eq!(m.status(), Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_heartbeat_interval_is_clamped() {
        let probe = Arc::new(StaticProbe::new(true));
        let settings = HealthSettings {
            heartbeat_interval: Duration::ZERO,
            ..HealthSettings::default()
        };
        let m = ConnectionHealthManager::new(settings, probe.clone(), Arc::new(EngineMetrics::new()));

        assert_eq!(m.connect().await, Connected);
        tokio::time::sleep(Duration::from_millis(3500)).await;

        // initial connect + probes at 1s, 2s, 3s
        assert_eq!(probe.calls(), 4);
        assert_eq!(m.status(), Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_until_exhausted() {
        let probe = Arc::new(StaticProbe::new(true));
        let m = manager(probe.clone());
        let mut rx = m.subscribe();

        m.connect().await;
        probe.set_healthy(false);

        // heartbeat fails at 30s, then 2+4+8+16+32 seconds of backoff
        tokio::time::sleep(Duration::from_secs(30 + 62 + 5)).await;

        let events = drain(&mut rx);
        let delays: Vec<(u32, Duration)> = events
            .iter()
            .filter_map(|e| match e {
                HealthEvent::Reconnecting { attempt, delay } => Some((*attempt, *delay)),
                _ => None,
            })
            .collect();

        assert_eq!(delays.len(), 5);
        for (n, (attempt, delay)) in delays.iter().enumerate() {
            assert_eq!(*attempt, n as u32 + 1);
            assert_eq!(*delay, Duration::from_secs(2) * 2u32.pow(n as u32));
        }

        let state = m.state();
        assert_eq!(state.status, Error);
        assert_eq!(state.reconnect_attempts, 5);
        assert!(state.last_error.is_some());

        // No further attempts once exhausted.
        let calls = probe.calls();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(probe.calls(), calls);

        // The first failures go through `disconnected`; `error` only after exhaustion.
        let edges = statuses(&events);
        assert_eq!(edges[2], (Connected, Disconnected));
        assert_eq!(*edges.last().unwrap(), (Connecting, Error));
        assert_eq!(edges.iter().filter(|(_, to)| *to == Error).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_first_retry() {
        let probe = Arc::new(StaticProbe::new(true));
        let m = manager(probe.clone());

        m.connect().await;
        let mut rx = m.subscribe();
        probe.set_healthy(false);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(m.status(), Disconnected);
        probe.set_healthy(true);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(m.status(), Connected);
        assert_eq!(m.state().reconnect_attempts, 0);

        let events = drain(&mut rx);
        assert_eq!(
            statuses(&events),
            vec![
                (Connected, Disconnected),
                (Disconnected, Connecting),
                (Connecting, Connected),
            ]
        );
        assert!(events.contains(&HealthEvent::Reconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_reconnect_leaves_exhausted_error() {
        let probe = Arc::new(StaticProbe::new(false));
        let m = manager(probe.clone());

        m.connect().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(m.status(), Error);

        let mut rx = m.subscribe();
        probe.set_healthy(true);
        assert_eq!(m.force_reconnect().await, Connected);
        assert_eq!(m.state().reconnect_attempts, 0);

        let events = drain(&mut rx);
        assert_eq!(statuses(&events), vec![(Error, Connecting), (Connecting, Connected)]);
        assert_eq!(events.last(), Some(&HealthEvent::Reconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_cancels_timers_and_keeps_status() {
        let probe = Arc::new(StaticProbe::new(false));
        let m = manager(probe.clone());

        assert_eq!(m.connect().await, Disconnected);
        assert_eq!(m.state().reconnect_attempts, 1);

        m.destroy();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(probe.calls(), 1);
        let state = m.state();
        assert_eq!(state.status, Disconnected);
        assert_eq!(state.reconnect_attempts, 0);
        assert!(state.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipping_connecting_is_rejected() {
        let m = manager(Arc::new(StaticProbe::new(true)));
        assert!(!m.connected());
        assert_eq!(m.status(), Disconnected);

        assert!(m.connecting());
        assert!(m.connected());
        assert_eq!(m.status(), Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failures_do_not_double_schedule() {
        let probe = Arc::new(StaticProbe::new(true));
        let m = manager(probe);
        m.connect().await;

        m.error(AppError::transport("CHANNEL_ERROR"));
        m.disconnected(Some(AppError::timeout("TIMED_OUT")));
        m.error(AppError::transport("CHANNEL_ERROR"));

        let state = m.state();
        assert_eq!(state.status, Error);
        assert_eq!(state.reconnect_attempts, 1);
        assert_eq!(state.last_error.unwrap().message, "CHANNEL_ERROR");
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_allowed_edges_are_observed() {
        let probe = Arc::new(StaticProbe::new(true));
        let m = manager(probe.clone());
        let mut rx = m.subscribe();

        m.connect().await;
        for healthy in [false, true, false, false, true, false] {
            probe.set_healthy(healthy);
            tokio::time::sleep(Duration::from_secs(45)).await;
        }
        m.error(AppError::transport("CHANNEL_ERROR"));
        m.force_reconnect().await;
        m.connected();

        for (from, to) in statuses(&drain(&mut rx)) {
            assert!(from.can_transition_to(to), "{from} -> {to}");
        }
    }

    #[test]
    fn test_backoff_delay_formula() {
        let m = ConnectionHealthManager::new(
            HealthSettings {
                heartbeat_interval: Duration::from_secs(30),
                max_attempts: 5,
                base_delay: Duration::from_millis(2000),
            },
            Arc::new(StaticProbe::default()),
            Arc::new(EngineMetrics::new()),
        );
        assert_eq!(m.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(m.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(m.backoff_delay(5), Duration::from_secs(32));
    }
}
