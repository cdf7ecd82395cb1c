//! Live activity feed for one workspace: a snapshot read with live inserts
//! layered on top.
//!
//! The listener and row-change filter are attached before the snapshot is
//! read so inserts that land during the read are not lost; duplicates are
//! dropped by id. Actor enrichment for live inserts is collected over a
//! short window and resolved in one batch.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use carehub_core::config::ActivityConfig;
use carehub_core::error::AppError;
use carehub_core::result::AppResult;
use carehub_core::types::{UserId, WorkspaceId};

use crate::channel::{ChannelHandle, ChannelListener, ChannelName, ChannelRegistry};
use crate::connection::ConnectionStatus;
use crate::transport::{ChannelEvent, RowChange, RowChangeFilter, RowChangeKind};

use super::buffer::ActivityBuffer;
use super::enrichment::ActorResolver;
use super::store::ActivityStore;
use super::types::ActivityEvent;

const ACTIVITY_SCHEMA: &str = "public";
const ACTIVITY_TABLE: &str = "activities";

/// Everything a feed needs from the engine.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub registry: Arc<ChannelRegistry>,
    pub store: Arc<dyn ActivityStore>,
    pub resolver: Arc<ActorResolver>,
    pub config: ActivityConfig,
}

/// Observable state of a feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedState {
    /// Newest-first events.
    pub buffer: ActivityBuffer,
    /// Subscription status.
    pub status: ConnectionStatus,
    /// Failure behind an `error` status.
    pub error: Option<AppError>,
}

impl FeedState {
    fn new(limit: usize) -> Self {
        Self {
            buffer: ActivityBuffer::new(limit),
            status: ConnectionStatus::Connecting,
            error: None,
        }
    }

    fn fail(&mut self, error: AppError) {
        self.status = ConnectionStatus::Error;
        self.error = Some(error);
    }
}

/// A scoped activity subscription. Call [`ActivityFeed::close`] when the
/// view goes away; dropping the feed releases it on a best-effort basis.
#[derive(Debug)]
pub struct ActivityFeed {
    workspace_id: WorkspaceId,
    channel_name: String,
    registry: Arc<ChannelRegistry>,
    state: Arc<watch::Sender<FeedState>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ActivityFeed {
    /// Subscribes to the activity feed of `workspace_id`.
    ///
    /// Never fails: setup or snapshot failures leave the feed in `error`
    /// with an empty buffer and no live attachment.
    pub async fn subscribe(ctx: &ActivityContext, workspace_id: WorkspaceId) -> Self {
        let channel_name = ChannelName::activity(workspace_id).to_string();
        let state = Arc::new(watch::channel(FeedState::new(ctx.config.limit)).0);
        let mut feed = Self {
            workspace_id,
            channel_name,
            registry: ctx.registry.clone(),
            state,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
        };

        match feed.attach(ctx).await {
            Ok(task) => {
                *feed.task.get_mut().unwrap_or_else(|e| e.into_inner()) = Some(task);
                info!(
                    workspace_id = %workspace_id,
                    activities = feed.state.borrow().buffer.len(),
                    "Activity feed subscribed"
                );
            }
            Err(e) => {
                warn!(workspace_id = %workspace_id, error = %e, "Activity feed subscription failed");
                feed.state.send_modify(|s| s.fail(e));
                feed.registry.release_channel(&feed.channel_name).await;
            }
        }
        feed
    }

    async fn attach(&self, ctx: &ActivityContext) -> AppResult<JoinHandle<()>> {
        let handle = ctx.registry.get_or_create_channel(&self.channel_name).await?;
        let listener = handle.listen();
        handle
            .listen_row_changes(
                RowChangeFilter::inserts(ACTIVITY_SCHEMA, ACTIVITY_TABLE)
                    .eq("workspace_id", self.workspace_id),
            )
            .await?;

        let snapshot = load_snapshot(ctx, self.workspace_id).await?;
        let status = handle.status();
        self.state.send_modify(|s| {
            s.buffer.replace(snapshot);
            s.status = status;
            s.error = None;
        });

        let task = FeedTask {
            workspace_id: self.workspace_id,
            ctx: ctx.clone(),
            handle: handle.clone(),
            state: self.state.clone(),
            cancel: self.cancel.clone(),
            pending: HashSet::new(),
            flush_at: None,
            needs_resync: status != ConnectionStatus::Connected,
        };
        Ok(tokio::spawn(task.run(listener, handle.watch_status())))
    }

    /// Workspace this feed follows.
    pub fn workspace_id(&self) -> WorkspaceId {
        self.workspace_id
    }

    /// Name of the underlying channel.
    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    /// Newest-first copy of the buffered events.
    pub fn activities(&self) -> Vec<ActivityEvent> {
        self.state.borrow().buffer.to_vec()
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.state.borrow().status
    }

    /// Failure behind an `error` status.
    pub fn error(&self) -> Option<AppError> {
        self.state.borrow().error.clone()
    }

    /// Empties the buffer. Live inserts keep arriving.
    pub fn clear_activities(&self) {
        self.state.send_modify(|s| s.buffer.clear());
    }

    /// Watches the whole feed state.
    pub fn watch(&self) -> watch::Receiver<FeedState> {
        self.state.subscribe()
    }

    /// Stops the live task and releases the channel.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.registry.release_channel(&self.channel_name).await;
        self.state
            .send_modify(|s| s.status = ConnectionStatus::Disconnected);
        debug!(workspace_id = %self.workspace_id, "Activity feed closed");
    }
}

impl Drop for ActivityFeed {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let task = self.task.get_mut().unwrap_or_else(|e| e.into_inner()).take();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let registry = self.registry.clone();
        let name = std::mem::take(&mut self.channel_name);
        runtime.spawn(async move {
            if let Some(task) = task {
                let _ = task.await;
            }
            registry.release_channel(&name).await;
        });
    }
}

/// Reads the snapshot and resolves its actors in one batch.
async fn load_snapshot(
    ctx: &ActivityContext,
    workspace_id: WorkspaceId,
) -> AppResult<Vec<ActivityEvent>> {
    let mut events = ctx
        .store
        .recent_activities(workspace_id, ctx.config.limit)
        .await?;

    let users: Vec<UserId> = events.iter().filter_map(|e| e.user_id).collect();
    if !users.is_empty() {
        let actors = ctx.resolver.resolve_many(&users).await;
        for event in &mut events {
            if let Some(actor) = event.user_id.and_then(|u| actors.get(&u)) {
                event.actor = Some(actor.clone());
            }
        }
    }
    Ok(events)
}

struct FeedTask {
    workspace_id: WorkspaceId,
    ctx: ActivityContext,
    handle: Arc<ChannelHandle>,
    state: Arc<watch::Sender<FeedState>>,
    cancel: CancellationToken,
    /// Users awaiting enrichment in the current window.
    pending: HashSet<UserId>,
    flush_at: Option<Instant>,
    /// Set once the channel leaves `connected`; the next `connected`
    /// rebuilds the buffer from a fresh snapshot.
    needs_resync: bool,
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl FeedTask {
    async fn run(
        mut self,
        mut listener: ChannelListener,
        mut status: watch::Receiver<ConnectionStatus>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = *status.borrow_and_update();
                    self.on_status(current).await;
                }
                _ = wait_until(self.flush_at) => self.flush_enrichment().await,
                event = listener.recv() => match event {
                    Some(event) => self.on_event(event),
                    None => break,
                },
            }
        }
        debug!(workspace_id = %self.workspace_id, "Activity feed task stopped");
    }

    fn on_event(&mut self, event: ChannelEvent) {
        let ChannelEvent::RowChange(change) = event else {
            return;
        };
        if !is_activity_insert(&change) {
            return;
        }

        let activity = match ActivityEvent::from_row(&change.new) {
            Ok(activity) => activity,
            Err(e) => {
                warn!(workspace_id = %self.workspace_id, error = %e, "Skipping malformed activity row");
                return;
            }
        };
        if activity.workspace_id != self.workspace_id {
            return;
        }

        let user_id = activity.user_id;
        let inserted = self
            .state
            .send_if_modified(|s| s.buffer.push_front(activity));

        if let (true, Some(user_id)) = (inserted, user_id) {
            self.pending.insert(user_id);
            if self.flush_at.is_none() {
                self.flush_at = Some(Instant::now() + self.ctx.config.enrichment_window());
            }
        }
    }

    async fn flush_enrichment(&mut self) {
        self.flush_at = None;
        let users: Vec<UserId> = self.pending.drain().collect();
        if users.is_empty() {
            return;
        }

        let actors = self.ctx.resolver.resolve_many(&users).await;
        self.state.send_if_modified(|s| {
            let mut updated = 0;
            for (user_id, actor) in &actors {
                updated += s.buffer.set_actor(*user_id, actor);
            }
            updated > 0
        });
    }

    async fn on_status(&mut self, status: ConnectionStatus) {
        match status {
            ConnectionStatus::Connected if self.needs_resync => {
                self.needs_resync = false;
                self.resync().await;
            }
            ConnectionStatus::Connected => {
                self.state.send_if_modified(|s| {
                    let changed = s.status != ConnectionStatus::Connected;
                    s.status = ConnectionStatus::Connected;
                    changed
                });
            }
            ConnectionStatus::Error => {
                self.needs_resync = true;
                let error = self.handle.last_error().unwrap_or_else(|| {
                    AppError::transport(format!("CHANNEL_ERROR on {}", self.handle.name()))
                });
                warn!(workspace_id = %self.workspace_id, error = %error, "Activity channel failed");
                self.state.send_modify(|s| s.fail(error));
            }
            other => {
                self.needs_resync = true;
                self.state.send_modify(|s| s.status = other);
            }
        }
    }

    /// Rebuilds the buffer after the channel recovered. On failure the
    /// stale buffer is kept and the feed reports `error`.
    async fn resync(&mut self) {
        match load_snapshot(&self.ctx, self.workspace_id).await {
            Ok(snapshot) => {
                self.pending.clear();
                self.flush_at = None;
                self.state.send_modify(|s| {
                    s.buffer.replace(snapshot);
                    s.status = ConnectionStatus::Connected;
                    s.error = None;
                });
                info!(workspace_id = %self.workspace_id, "Activity feed resynchronized");
            }
            Err(e) => {
                warn!(workspace_id = %self.workspace_id, error = %e, "Activity resync failed");
                self.state.send_modify(|s| s.fail(e));
            }
        }
    }
}

fn is_activity_insert(change: &RowChange) -> bool {
    change.event == RowChangeKind::Insert
        && change.schema == ACTIVITY_SCHEMA
        && change.table == ACTIVITY_TABLE
}
