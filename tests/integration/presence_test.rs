//! Integration tests for workspace presence between two clients.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use carehub_core::config::RealtimeConfig;
use carehub_core::types::{PatientId, UserId, WorkspaceId};
use carehub_realtime::connection::ConnectionStatus;
use carehub_realtime::presence::{PresenceRecord, PresenceStatus};
use carehub_realtime::transport::MemoryTransport;

use helpers::{TestEngine, settle};

async fn two_clients() -> (TestEngine, TestEngine) {
    let transport = Arc::new(MemoryTransport::new(64));
    let alice = TestEngine::on_transport(RealtimeConfig::default(), transport.clone());
    let bob = TestEngine::on_transport(RealtimeConfig::default(), transport);
    alice.engine.start().await;
    bob.engine.start().await;
    (alice, bob)
}

#[tokio::test(start_paused = true)]
async fn test_two_users_see_each_other() {
    let (alice, bob) = two_clients().await;
    let ws = WorkspaceId::new();
    let (alice_id, bob_id) = (UserId::new(), UserId::new());

    let alice_room = alice
        .engine
        .presence_room(PresenceRecord::new(alice_id, ws))
        .await
        .unwrap();
    let bob_room = bob
        .engine
        .presence_room(PresenceRecord::new(bob_id, ws))
        .await
        .unwrap();
    settle().await;

    for room in [&alice_room, &bob_room] {
        let roster = room.roster();
        assert_eq!(roster.len(), 2);
        assert!(roster.contains(alice_id));
        assert!(roster.contains(bob_id));
    }
    assert_eq!(alice_room.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_leave_is_visible_and_rejoin_restores() {
    let (alice, bob) = two_clients().await;
    let ws = WorkspaceId::new();
    let alice_id = UserId::new();

    let bob_room = bob
        .engine
        .presence_room(PresenceRecord::new(UserId::new(), ws))
        .await
        .unwrap();
    let alice_room = alice
        .engine
        .presence_room(PresenceRecord::new(alice_id, ws))
        .await
        .unwrap();
    settle().await;
    assert!(bob_room.roster().contains(alice_id));

    alice_room.close().await;
    settle().await;
    assert!(!bob_room.roster().contains(alice_id));
    assert_eq!(alice.engine.channels.channel_count(), 0);

    let _alice_room = alice
        .engine
        .presence_room(PresenceRecord::new(alice_id, ws))
        .await
        .unwrap();
    settle().await;
    assert!(bob_room.roster().contains(alice_id));
}

#[tokio::test(start_paused = true)]
async fn test_status_and_viewing_updates_propagate() {
    let (alice, bob) = two_clients().await;
    let ws = WorkspaceId::new();
    let patient = PatientId::new();
    let alice_id = UserId::new();

    let alice_room = alice
        .engine
        .presence_room(PresenceRecord::new(alice_id, ws))
        .await
        .unwrap();
    let bob_room = bob
        .engine
        .presence_room(PresenceRecord::new(UserId::new(), ws).with_status(PresenceStatus::Away))
        .await
        .unwrap();
    settle().await;
    assert!(bob_room.viewers_of(patient).is_empty());

    alice_room
        .update(PresenceStatus::Busy, Some(patient))
        .await
        .unwrap();
    settle().await;

    assert_eq!(bob_room.viewers_of(patient), vec![alice_id]);
    let grouped = bob_room.grouped();
    assert_eq!(grouped[&PresenceStatus::Busy].len(), 1);
    assert_eq!(grouped[&PresenceStatus::Away].len(), 1);
    assert!(!grouped.contains_key(&PresenceStatus::Online));

    alice_room.set_viewing(None).await.unwrap();
    settle().await;
    assert!(bob_room.viewers_of(patient).is_empty());
    assert_eq!(
        bob_room.roster().get(alice_id).map(|r| r.status),
        Some(PresenceStatus::Busy)
    );
}

#[tokio::test(start_paused = true)]
async fn test_presence_restored_after_reconnect() {
    let (alice, bob) = two_clients().await;
    let ws = WorkspaceId::new();
    let alice_id = UserId::new();

    let _alice_room = alice
        .engine
        .presence_room(PresenceRecord::new(alice_id, ws))
        .await
        .unwrap();
    let bob_room = bob
        .engine
        .presence_room(PresenceRecord::new(UserId::new(), ws))
        .await
        .unwrap();
    settle().await;

    // Both clients lose the socket; each reconnects after its first backoff.
    alice.transport.drop_connection();
    tokio::time::sleep(Duration::from_secs(3)).await;
    settle().await;

    assert_eq!(alice.engine.status(), ConnectionStatus::Connected);
    assert_eq!(bob.engine.status(), ConnectionStatus::Connected);
    let roster = bob_room.roster();
    assert_eq!(roster.len(), 2);
    assert!(roster.contains(alice_id));
}

#[tokio::test(start_paused = true)]
async fn test_second_surface_keeps_user_present_after_first_closes() {
    let (alice, bob) = two_clients().await;
    let ws = WorkspaceId::new();
    let alice_id = UserId::new();

    let sidebar = alice
        .engine
        .presence_room(PresenceRecord::new(alice_id, ws))
        .await
        .unwrap();
    let board = alice
        .engine
        .presence_room(PresenceRecord::new(alice_id, ws))
        .await
        .unwrap();
    let bob_room = bob
        .engine
        .presence_room(PresenceRecord::new(UserId::new(), ws))
        .await
        .unwrap();
    settle().await;

    sidebar.close().await;
    settle().await;
    assert!(board.roster().contains(alice_id));
    assert!(bob_room.roster().contains(alice_id));
    assert_eq!(alice.engine.channels.channel_count(), 1);

    drop(board);
    settle().await;
    assert!(!bob_room.roster().contains(alice_id));
    assert_eq!(alice.engine.channels.channel_count(), 0);
}
