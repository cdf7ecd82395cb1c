//! Shared test helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use carehub_core::config::RealtimeConfig;
use carehub_core::types::UserId;
use carehub_realtime::activity::{
    ActivityEvent, ActorInfo, MemoryActivityStore, MemoryProfileDirectory,
};
use carehub_realtime::connection::StaticProbe;
use carehub_realtime::transport::MemoryTransport;
use carehub_realtime::{Collaborators, RealtimeEngine};

/// An engine wired to in-memory collaborators the test can drive.
pub struct TestEngine {
    /// The engine under test
    pub engine: RealtimeEngine,
    /// Shared transport
    pub transport: Arc<MemoryTransport>,
    /// Heartbeat probe
    pub probe: Arc<StaticProbe>,
    /// Activity table
    pub store: Arc<MemoryActivityStore>,
    /// Profile directory
    pub directory: Arc<MemoryProfileDirectory>,
}

impl TestEngine {
    /// Engine with default configuration, not yet started.
    pub fn new() -> Self {
        Self::with_config(RealtimeConfig::default())
    }

    /// Engine with `config`, not yet started.
    pub fn with_config(config: RealtimeConfig) -> Self {
        Self::on_transport(config, Arc::new(MemoryTransport::new(256)))
    }

    /// Engine sharing an existing transport, as a second client would.
    pub fn on_transport(config: RealtimeConfig, transport: Arc<MemoryTransport>) -> Self {
        let probe = Arc::new(StaticProbe::new(true));
        let store = Arc::new(MemoryActivityStore::new());
        let directory = Arc::new(MemoryProfileDirectory::new());
        let engine = RealtimeEngine::new(
            &config,
            Collaborators {
                transport: transport.clone(),
                probe: probe.clone(),
                activities: store.clone(),
                profiles: directory.clone(),
            },
        )
        .expect("valid realtime config");
        Self {
            engine,
            transport,
            probe,
            store,
            directory,
        }
    }

    /// Started engine with default configuration.
    pub async fn started() -> Self {
        let app = Self::new();
        app.engine.start().await;
        app
    }

    /// Writes the activity row and emits its INSERT, as the database would.
    pub fn insert_activity(&self, event: &ActivityEvent) {
        self.store.insert(event.clone());
        self.transport
            .insert_row("public", "activities", event.to_row());
    }

    /// Registers a profile and returns its user id.
    pub fn add_profile(&self, full_name: &str) -> UserId {
        let user_id = UserId::new();
        self.directory.insert(
            user_id,
            ActorInfo {
                full_name: full_name.to_string(),
                avatar_url: None,
                title: None,
            },
        );
        user_id
    }
}

/// Lets spawned tasks drain their queues and the enrichment window elapse.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(250)).await;
}
