//! Integration tests for connection health and reconnect behavior.

mod helpers;

use std::time::Duration;

use tokio::sync::broadcast;

use carehub_realtime::connection::{ConnectionStatus, HealthEvent};

use helpers::{TestEngine, settle};

fn drain(rx: &mut broadcast::Receiver<HealthEvent>) -> Vec<HealthEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn transitions(events: &[HealthEvent]) -> Vec<(ConnectionStatus, ConnectionStatus)> {
    events
        .iter()
        .filter_map(|e| match e {
            HealthEvent::StatusChanged { from, to } => Some((*from, *to)),
            _ => None,
        })
        .collect()
}

fn scheduled_delays(events: &[HealthEvent]) -> Vec<Duration> {
    events
        .iter()
        .filter_map(|e| match e {
            HealthEvent::Reconnecting { delay, .. } => Some(*delay),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_start_connects_and_heartbeats() {
    let app = TestEngine::new();
    let mut events = app.engine.health_events();

    assert_eq!(app.engine.start().await, ConnectionStatus::Connected);
    tokio::time::sleep(Duration::from_secs(95)).await;

    assert_eq!(
        transitions(&drain(&mut events)),
        vec![
            (ConnectionStatus::Disconnected, ConnectionStatus::Connecting),
            (ConnectionStatus::Connecting, ConnectionStatus::Connected),
        ]
    );
    assert_eq!(app.engine.metrics.snapshot().heartbeats_ok, 3);
}

#[tokio::test(start_paused = true)]
async fn test_recovers_after_transient_failures_without_error() {
    let app = TestEngine::started().await;
    let mut events = app.engine.health_events();

    app.probe.set_healthy(false);
    app.engine.health.disconnected(None);

    // Attempts run at 2s and 6s and both fail.
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(app.engine.status(), ConnectionStatus::Disconnected);
    app.probe.set_healthy(true);

    // Third attempt runs at 14s.
    tokio::time::sleep(Duration::from_secs(8)).await;
    assert_eq!(app.engine.status(), ConnectionStatus::Connected);

    let events = drain(&mut events);
    assert_eq!(
        scheduled_delays(&events),
        vec![
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(8)
        ]
    );
    let edges = transitions(&events);
    assert!(edges.iter().all(|(from, to)| from.can_transition_to(*to)));
    assert!(edges.iter().all(|(_, to)| *to != ConnectionStatus::Error));
    assert_eq!(
        edges.last(),
        Some(&(ConnectionStatus::Connecting, ConnectionStatus::Connected))
    );
    assert!(events.contains(&HealthEvent::Reconnected));
    assert_eq!(app.engine.health.state().reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_then_forced_reconnect_resubscribes() {
    let app = TestEngine::started().await;
    let handle = app
        .engine
        .channels
        .get_or_create_channel("notifications:workspace:ops")
        .await
        .unwrap();
    let joins_before = app.transport.join_count();

    app.probe.set_healthy(false);
    app.engine.health.disconnected(None);

    // 2 + 4 + 8 + 16 + 32 seconds of backoff.
    tokio::time::sleep(Duration::from_secs(63)).await;
    assert_eq!(app.engine.status(), ConnectionStatus::Error);
    assert_eq!(app.engine.health.state().reconnect_attempts, 5);
    assert!(app.engine.health.state().last_error.is_some());

    // Nothing retries on its own once exhausted.
    let calls = app.probe.calls();
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(app.probe.calls(), calls);
    assert_eq!(app.engine.status(), ConnectionStatus::Error);

    app.probe.set_healthy(true);
    assert_eq!(
        app.engine.force_reconnect().await,
        ConnectionStatus::Connected
    );
    settle().await;

    assert_eq!(app.engine.health.state().reconnect_attempts, 0);
    assert_eq!(app.transport.join_count(), joins_before + 1);
    assert_eq!(handle.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_failed_initial_connect_schedules_retry() {
    let app = TestEngine::new();
    app.probe.set_healthy(false);

    assert_eq!(app.engine.start().await, ConnectionStatus::Disconnected);
    assert_eq!(app.engine.health.state().reconnect_attempts, 1);

    app.probe.set_healthy(true);
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(app.engine.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_failed_heartbeat_triggers_reconnect() {
    let app = TestEngine::started().await;
    let mut events = app.engine.health_events();
    app.probe.set_healthy(false);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(app.engine.status(), ConnectionStatus::Disconnected);

    app.probe.set_healthy(true);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(app.engine.status(), ConnectionStatus::Connected);

    assert_eq!(
        transitions(&drain(&mut events)),
        vec![
            (ConnectionStatus::Connected, ConnectionStatus::Disconnected),
            (ConnectionStatus::Disconnected, ConnectionStatus::Connecting),
            (ConnectionStatus::Connecting, ConnectionStatus::Connected),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_all_timers() {
    let app = TestEngine::started().await;
    app.engine
        .channels
        .get_or_create_channel("t")
        .await
        .unwrap();

    app.engine.shutdown().await;
    let calls = app.probe.calls();
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(app.probe.calls(), calls);
    assert_eq!(app.engine.channels.channel_count(), 0);
}
