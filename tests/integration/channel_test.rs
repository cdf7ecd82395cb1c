//! Integration tests for the channel registry over a shared transport.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use carehub_core::config::RealtimeConfig;
use carehub_core::types::{PatientId, WorkspaceId};
use carehub_realtime::channel::{ChannelName, ChannelPurpose};
use carehub_realtime::connection::ConnectionStatus;
use carehub_realtime::transport::{BroadcastMessage, ChannelEvent};

use helpers::{TestEngine, settle};

#[tokio::test(start_paused = true)]
async fn test_same_name_returns_same_handle() {
    let app = TestEngine::started().await;
    let name = ChannelName::notifications(WorkspaceId::new()).to_string();

    let first = app.engine.channels.get_or_create_channel(&name).await.unwrap();
    let second = app.engine.channels.get_or_create_channel(&name).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(app.transport.join_count(), 1);
    assert_eq!(app.engine.channels.channel_names(), vec![name]);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_creators_share_one_join() {
    let app = TestEngine::started().await;
    let channels = &app.engine.channels;

    let (a, b) = tokio::join!(
        channels.get_or_create_channel("room"),
        channels.get_or_create_channel("room"),
    );

    assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    assert_eq!(app.transport.join_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_remove_then_create_yields_fresh_handle() {
    let app = TestEngine::started().await;
    let channels = &app.engine.channels;

    let old = channels.get_or_create_channel("room").await.unwrap();
    assert!(channels.remove_channel("room").await);
    assert!(old.is_closed());
    assert_eq!(old.status(), ConnectionStatus::Disconnected);
    assert_eq!(app.transport.subscription_count("room"), 0);

    let new = channels.get_or_create_channel("room").await.unwrap();
    assert!(!Arc::ptr_eq(&old, &new));
    assert_eq!(new.status(), ConnectionStatus::Connected);
    assert!(!channels.remove_channel("missing").await);
}

#[tokio::test(start_paused = true)]
async fn test_setup_failure_leaves_no_entry() {
    let app = TestEngine::started().await;
    app.transport.reject_joins(true);

    let result = app.engine.channels.get_or_create_channel("room").await;

    assert!(result.is_err());
    assert_eq!(app.engine.channels.channel_count(), 0);

    app.transport.reject_joins(false);
    let handle = app.engine.channels.get_or_create_channel("room").await.unwrap();
    assert_eq!(handle.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_transient_join_failures_are_retried() {
    let app = TestEngine::started().await;
    app.transport.fail_next_joins(2);

    let handle = app.engine.channels.get_or_create_channel("room").await.unwrap();

    assert_eq!(handle.status(), ConnectionStatus::Connected);
    assert_eq!(app.transport.join_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_reaches_other_client() {
    let transport = Arc::new(carehub_realtime::transport::MemoryTransport::new(64));
    let alice = TestEngine::on_transport(RealtimeConfig::default(), transport.clone());
    let bob = TestEngine::on_transport(RealtimeConfig::default(), transport);
    alice.engine.start().await;
    bob.engine.start().await;

    let name = ChannelName::notifications(WorkspaceId::new()).to_string();
    let sender = alice.engine.channels.get_or_create_channel(&name).await.unwrap();
    let receiver = bob.engine.channels.get_or_create_channel(&name).await.unwrap();
    let mut own = sender.listen();
    let mut listener = receiver.listen();

    sender
        .send_broadcast("patient_flagged", json!({"severity": "high"}))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(1), listener.recv())
        .await
        .unwrap();
    assert_eq!(
        event,
        Some(ChannelEvent::Broadcast(BroadcastMessage {
            event: "patient_flagged".to_string(),
            payload: json!({"severity": "high"}),
        }))
    );
    settle().await;
    assert!(own.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_listeners_keep_channel_alive_until_released() {
    let app = TestEngine::started().await;
    let channels = &app.engine.channels;
    let handle = channels.get_or_create_channel("room").await.unwrap();

    let listener = handle.listen();
    assert_eq!(listener.attached(), 1);
    assert!(!channels.release_channel("room").await);

    drop(listener);
    assert!(channels.release_channel("room").await);
    assert_eq!(channels.channel_count(), 0);
}

#[test]
fn test_channel_names_parse_back() {
    let workspace = WorkspaceId::new();
    let patient = PatientId::new();

    let name = ChannelName::presence(workspace).with_patient(patient);
    let parsed: ChannelName = name.to_string().parse().unwrap();

    assert_eq!(parsed, name);
    assert_eq!(parsed.purpose, ChannelPurpose::Presence);
    assert_eq!(parsed.patient_id, Some(patient));
    assert!("presence:ward:abc".parse::<ChannelName>().is_err());
}
