//! CareHub realtime sync sandbox
//!
//! Wires the realtime engine over in-process collaborators, opens the
//! activity feed and presence room of one workspace, and runs until
//! Ctrl+C or SIGTERM.

use std::sync::Arc;

use tracing_subscriber::{EnvFilter, fmt};

use carehub_core::config::AppConfig;
use carehub_core::error::AppError;
use carehub_core::types::{UserId, WorkspaceId};
use carehub_realtime::activity::{MemoryActivityStore, MemoryProfileDirectory};
use carehub_realtime::connection::StaticProbe;
use carehub_realtime::presence::PresenceRecord;
use carehub_realtime::transport::MemoryTransport;
use carehub_realtime::{Collaborators, RealtimeEngine};

#[tokio::main]
async fn main() {
    let env = std::env::var("CAREHUB_ENV").unwrap_or_else(|_| "development".to_string());
    let config = match AppConfig::load(&env) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config);

    if let Err(e) = run(config).await {
        tracing::error!("Sync engine error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize tracing/logging
fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .init();
        }
        _ => {
            fmt()
                .pretty()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
    }
}

/// Main run function
async fn run(config: AppConfig) -> Result<(), AppError> {
    tracing::info!("Starting CareHub sync v{}", env!("CARGO_PKG_VERSION"));

    let workspace_id = match std::env::var("CAREHUB_WORKSPACE_ID") {
        Ok(raw) => raw
            .parse::<WorkspaceId>()
            .map_err(|e| AppError::validation(format!("Invalid CAREHUB_WORKSPACE_ID: {e}")))?,
        Err(_) => WorkspaceId::new(),
    };

    let engine = RealtimeEngine::new(
        &config.realtime,
        Collaborators {
            transport: Arc::new(MemoryTransport::new(config.realtime.channel_buffer_size)),
            probe: Arc::new(StaticProbe::new(true)),
            activities: Arc::new(MemoryActivityStore::new()),
            profiles: Arc::new(MemoryProfileDirectory::new()),
        },
    )?;

    let status = engine.start().await;
    tracing::info!(status = %status, workspace_id = %workspace_id, "Connection ready");

    let feed = engine.activity_feed(workspace_id).await;
    let room = engine
        .presence_room(PresenceRecord::new(UserId::new(), workspace_id))
        .await?;
    tracing::info!(
        channels = ?engine.channels.channel_names(),
        activities = feed.activities().len(),
        "Workspace subscriptions open"
    );

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown...");

    room.close().await;
    feed.close().await;
    engine.shutdown().await;

    match serde_json::to_string(&engine.metrics.snapshot()) {
        Ok(metrics) => tracing::info!(metrics = %metrics, "CareHub sync shut down gracefully"),
        Err(_) => tracing::info!("CareHub sync shut down gracefully"),
    }
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
