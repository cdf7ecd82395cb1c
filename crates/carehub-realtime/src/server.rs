//! Top-level realtime engine that ties together all subsystems.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use carehub_core::config::RealtimeConfig;
use carehub_core::error::AppError;
use carehub_core::result::AppResult;
use carehub_core::types::WorkspaceId;

use crate::activity::{ActivityContext, ActivityFeed, ActivityStore, ActorResolver, ProfileDirectory};
use crate::channel::{ChannelRegistry, ChannelStatusEvent, StatusOrigin};
use crate::connection::{
    ConnectionHealthManager, ConnectionStatus, HealthEvent, HealthProbe, HealthSettings,
};
use crate::metrics::EngineMetrics;
use crate::presence::{PresenceRecord, PresenceRoom};
use crate::retry::RetryPolicy;
use crate::transport::RealtimeTransport;

/// External collaborators the engine runs against.
#[derive(Debug, Clone)]
pub struct Collaborators {
    /// Shared realtime transport.
    pub transport: Arc<dyn RealtimeTransport>,
    /// Liveness probe for the heartbeat.
    pub probe: Arc<dyn HealthProbe>,
    /// Activity snapshot source.
    pub activities: Arc<dyn ActivityStore>,
    /// Profile lookups for actor enrichment.
    pub profiles: Arc<dyn ProfileDirectory>,
}

/// Central realtime engine: one health manager, one channel registry, and
/// the factories for scoped feeds and presence rooms.
pub struct RealtimeEngine {
    /// Connection health manager.
    pub health: Arc<ConnectionHealthManager>,
    /// Channel registry.
    pub channels: Arc<ChannelRegistry>,
    /// Metrics collector.
    pub metrics: Arc<EngineMetrics>,
    activity: ActivityContext,
    shutdown: CancellationToken,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RealtimeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeEngine")
            .field("status", &self.health.status())
            .field("channels", &self.channels.channel_count())
            .finish()
    }
}

impl RealtimeEngine {
    /// Creates a new engine. Nothing runs until [`RealtimeEngine::start`].
    ///
    /// Fails with a configuration error if `config` does not validate.
    pub fn new(config: &RealtimeConfig, collaborators: Collaborators) -> AppResult<Self> {
        config.validate()?;

        let metrics = Arc::new(EngineMetrics::new());
        let health = ConnectionHealthManager::new(
            HealthSettings::from(config),
            collaborators.probe,
            metrics.clone(),
        );
        let channels = Arc::new(ChannelRegistry::new(
            collaborators.transport,
            RetryPolicy::from(&config.subscribe_retry),
            config.channel_buffer_size,
            metrics.clone(),
        ));
        let resolver = Arc::new(ActorResolver::new(
            collaborators.profiles,
            &config.activity,
            metrics.clone(),
        ));
        let activity = ActivityContext {
            registry: channels.clone(),
            store: collaborators.activities,
            resolver,
            config: config.activity.clone(),
        };

        info!("Realtime engine initialized");

        Ok(Self {
            health,
            channels,
            metrics,
            activity,
            shutdown: CancellationToken::new(),
            coordinator: Mutex::new(None),
        })
    }

    /// Starts health/channel coordination and performs the initial connect.
    pub async fn start(&self) -> ConnectionStatus {
        {
            let mut coordinator = self.coordinator.lock().unwrap_or_else(|e| e.into_inner());
            if coordinator.is_none() {
                *coordinator = Some(tokio::spawn(coordinate(
                    self.health.clone(),
                    self.channels.clone(),
                    self.health.subscribe(),
                    self.channels.subscribe_status(),
                    self.shutdown.clone(),
                )));
            }
        }

        let status = self.health.connect().await;
        info!(status = %status, "Realtime engine started");
        status
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.health.status()
    }

    /// Subscribes to health events.
    pub fn health_events(&self) -> broadcast::Receiver<HealthEvent> {
        self.health.subscribe()
    }

    /// Opens the activity feed of `workspace_id`.
    pub async fn activity_feed(&self, workspace_id: WorkspaceId) -> ActivityFeed {
        ActivityFeed::subscribe(&self.activity, workspace_id).await
    }

    /// Joins the presence channel of `local.workspace_id` as `local`.
    pub async fn presence_room(&self, local: PresenceRecord) -> AppResult<PresenceRoom> {
        PresenceRoom::join(self.channels.clone(), local).await
    }

    /// Resets the reconnect budget and re-probes immediately. A successful
    /// probe re-subscribes every channel.
    pub async fn force_reconnect(&self) -> ConnectionStatus {
        self.health.force_reconnect().await
    }

    /// Stops timers and coordination, then closes every channel.
    pub async fn shutdown(&self) {
        info!("Shutting down realtime engine");

        self.shutdown.cancel();
        let coordinator = self
            .coordinator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(coordinator) = coordinator {
            let _ = coordinator.await;
        }

        self.health.destroy();
        self.channels.remove_all_channels().await;

        info!("Realtime engine shut down");
    }
}

/// Couples the health manager and the registry: a recovered connection
/// drives a full resubscribe pass, and both a failed pass and channel
/// failures reported by the transport feed the health manager's backoff.
async fn coordinate(
    health: Arc<ConnectionHealthManager>,
    channels: Arc<ChannelRegistry>,
    mut health_events: broadcast::Receiver<HealthEvent>,
    mut channel_events: broadcast::Receiver<ChannelStatusEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = health_events.recv() => match event {
                Ok(HealthEvent::Reconnected) => {
                    let failures = channels.resubscribe_all().await;
                    if failures > 0 {
                        health.subscriptions_failed(AppError::service_unavailable(format!(
                            "{failures} channel(s) failed to resubscribe after reconnect"
                        )));
                    } else {
                        health.subscriptions_restored();
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Health event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
            event = channel_events.recv() => match event {
                Ok(event) if event.origin == StatusOrigin::Transport => {
                    route_channel_failure(&health, event);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Channel status stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    debug!("Engine coordinator stopped");
}

fn route_channel_failure(health: &Arc<ConnectionHealthManager>, event: ChannelStatusEvent) {
    match event.status {
        ConnectionStatus::Error => {
            let error = event
                .error
                .unwrap_or_else(|| AppError::transport(format!("CHANNEL_ERROR on {}", event.name)));
            health.error(error);
        }
        ConnectionStatus::Disconnected => {
            health.disconnected(event.error);
        }
        _ => {}
    }
}
