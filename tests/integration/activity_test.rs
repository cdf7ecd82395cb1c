//! Integration tests for workspace activity feeds.

mod helpers;

use std::time::Duration;

use carehub_core::config::RealtimeConfig;
use carehub_core::types::WorkspaceId;
use carehub_realtime::activity::{ActivityEvent, ActivityType};
use carehub_realtime::connection::ConnectionStatus;

use helpers::{TestEngine, settle};

#[tokio::test(start_paused = true)]
async fn test_first_insert_into_empty_workspace() {
    let app = TestEngine::started().await;
    let ws = WorkspaceId::new();
    let user = app.add_profile("Dr. Amara Osei");

    let feed = app.engine.activity_feed(ws).await;
    assert!(feed.activities().is_empty());
    assert_eq!(feed.status(), ConnectionStatus::Connected);

    let event = ActivityEvent::new(ws, Some(user), ActivityType::PatientCreated);
    app.insert_activity(&event);
    settle().await;

    let activities = feed.activities();
    assert_eq!(activities.len(), 1);
    assert_eq!(activities[0].id, event.id);
    assert_eq!(activities[0].activity_type, ActivityType::PatientCreated);
    assert_eq!(
        activities[0].actor.as_ref().unwrap().full_name,
        "Dr. Amara Osei"
    );
    feed.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_limit_two_keeps_last_two_inserts() {
    let mut config = RealtimeConfig::default();
    config.activity.limit = 2;
    let app = TestEngine::with_config(config);
    app.engine.start().await;
    let ws = WorkspaceId::new();
    let feed = app.engine.activity_feed(ws).await;

    let events: Vec<_> = (0..3)
        .map(|_| ActivityEvent::new(ws, None, ActivityType::NoteCreated))
        .collect();
    for event in &events {
        app.insert_activity(event);
    }
    settle().await;

    let ids: Vec<_> = feed.activities().iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![events[2].id, events[1].id]);
}

#[tokio::test(start_paused = true)]
async fn test_buffer_bounded_and_newest_first_under_bursts() {
    let app = TestEngine::started().await;
    let ws = WorkspaceId::new();
    let feed = app.engine.activity_feed(ws).await;

    let mut last = None;
    for round in 0..4 {
        for _ in 0..20 {
            let event = ActivityEvent::new(ws, None, ActivityType::DataAdded);
            app.insert_activity(&event);
            last = Some(event.id);
        }
        tokio::time::sleep(Duration::from_millis(10 * round)).await;
        settle().await;

        let activities = feed.activities();
        assert!(activities.len() <= 50);
        assert_eq!(Some(activities[0].id), last);
    }
    assert_eq!(feed.activities().len(), 50);
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_is_enriched_in_one_lookup() {
    let app = TestEngine::new();
    let ws = WorkspaceId::new();
    let a = app.add_profile("A");
    let b = app.add_profile("B");
    for user in [a, b, a, b] {
        app.store
            .insert(ActivityEvent::new(ws, Some(user), ActivityType::PatientViewed));
    }
    app.engine.start().await;

    let feed = app.engine.activity_feed(ws).await;

    assert_eq!(feed.activities().len(), 4);
    assert!(feed.activities().iter().all(|e| e.actor.is_some()));
    assert_eq!(app.directory.lookup_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_failure_surfaces_error() {
    let app = TestEngine::started().await;
    app.store.set_failing(true);
    let ws = WorkspaceId::new();

    let feed = app.engine.activity_feed(ws).await;

    assert_eq!(feed.status(), ConnectionStatus::Error);
    assert!(feed.activities().is_empty());
    assert!(app.engine.channels.channel_names().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_rebuilds_feed_from_snapshot() {
    let app = TestEngine::started().await;
    let ws = WorkspaceId::new();
    let feed = app.engine.activity_feed(ws).await;
    let mut view = feed.watch();

    app.transport.drop_connection();
    settle().await;
    assert_eq!(feed.status(), ConnectionStatus::Error);
    assert_eq!(app.engine.status(), ConnectionStatus::Error);

    // Written while the channel was down; no live INSERT reaches the feed.
    let missed = ActivityEvent::new(ws, None, ActivityType::TestAdded);
    app.store.insert(missed.clone());

    // First reconnect attempt fires after the 2s base delay.
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(app.engine.status(), ConnectionStatus::Connected);
    assert_eq!(feed.status(), ConnectionStatus::Connected);
    assert_eq!(feed.activities()[0].id, missed.id);
    assert!(view.has_changed().unwrap());

    let live = ActivityEvent::new(ws, None, ActivityType::ChatMessageSent);
    app.insert_activity(&live);
    settle().await;
    assert_eq!(feed.activities()[0].id, live.id);
    assert_eq!(feed.activities().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_workspace_switch_does_not_leak_channels() {
    let app = TestEngine::started().await;
    let first = WorkspaceId::new();
    let second = WorkspaceId::new();

    let feed = app.engine.activity_feed(first).await;
    feed.close().await;
    let feed = app.engine.activity_feed(second).await;

    let names = app.engine.channels.channel_names();
    assert_eq!(names, vec![format!("activity:workspace:{second}")]);

    app.insert_activity(&ActivityEvent::new(first, None, ActivityType::NoteUpdated));
    settle().await;
    assert!(feed.activities().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_feed_releases_channel() {
    let app = TestEngine::started().await;
    let ws = WorkspaceId::new();

    {
        let _feed = app.engine.activity_feed(ws).await;
        assert_eq!(app.engine.channels.channel_count(), 1);
    }
    settle().await;

    assert_eq!(app.engine.channels.channel_count(), 0);
}
