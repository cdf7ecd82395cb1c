//! A local session's membership in a workspace presence channel.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use carehub_core::result::AppResult;
use carehub_core::types::{PatientId, UserId, WorkspaceId};

use crate::channel::{ChannelHandle, ChannelListener, ChannelName, ChannelRegistry, TrackId};
use crate::connection::ConnectionStatus;
use crate::transport::ChannelEvent;

use super::roster::{PresenceRecord, PresenceRoster};
use super::status::PresenceStatus;

/// Scoped presence subscription for one local session.
///
/// Rooms for the same workspace in one process share a channel handle and
/// each holds its own tracker on it. Closing one room keeps the session
/// present while another room still tracks it.
#[derive(Debug)]
pub struct PresenceRoom {
    workspace_id: WorkspaceId,
    channel_name: String,
    registry: Arc<ChannelRegistry>,
    handle: Arc<ChannelHandle>,
    track_id: TrackId,
    local: Mutex<PresenceRecord>,
    roster: Arc<watch::Sender<PresenceRoster>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PresenceRoom {
    /// Joins `presence:workspace:<id>` for `local.workspace_id`, attaches
    /// the roster listener, then tracks `local`.
    pub async fn join(registry: Arc<ChannelRegistry>, local: PresenceRecord) -> AppResult<Self> {
        let workspace_id = local.workspace_id;
        let channel_name = ChannelName::presence(workspace_id).to_string();
        let handle = registry.get_or_create_channel(&channel_name).await?;

        let roster = Arc::new(watch::channel(PresenceRoster::new(workspace_id)).0);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_roster(
            handle.listen(),
            roster.clone(),
            cancel.clone(),
        ));

        let track_id = handle.track_id();
        if let Err(e) = handle.track(track_id, &local.key(), local.to_payload()).await {
            warn!(workspace_id = %workspace_id, error = %e, "Presence track failed");
            let _ = handle.untrack(track_id).await;
            cancel.cancel();
            let _ = task.await;
            registry.release_channel(&channel_name).await;
            return Err(e);
        }

        info!(workspace_id = %workspace_id, user_id = %local.user_id, "Joined presence");
        Ok(Self {
            workspace_id,
            channel_name,
            registry,
            handle,
            track_id,
            local: Mutex::new(local),
            roster,
            cancel,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        })
    }

    fn local(&self) -> MutexGuard<'_, PresenceRecord> {
        self.local.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Workspace of this room.
    pub fn workspace_id(&self) -> WorkspaceId {
        self.workspace_id
    }

    /// The record this session tracks.
    pub fn local_record(&self) -> PresenceRecord {
        self.local().clone()
    }

    /// Status of the presence channel.
    pub fn status(&self) -> ConnectionStatus {
        self.handle.status()
    }

    /// Current roster snapshot.
    pub fn roster(&self) -> PresenceRoster {
        self.roster.borrow().clone()
    }

    /// Watches roster changes.
    pub fn watch(&self) -> watch::Receiver<PresenceRoster> {
        self.roster.subscribe()
    }

    /// Roster grouped by status.
    pub fn grouped(&self) -> BTreeMap<PresenceStatus, Vec<PresenceRecord>> {
        self.roster.borrow().grouped()
    }

    /// Users currently viewing `patient_id`.
    pub fn viewers_of(&self, patient_id: PatientId) -> Vec<UserId> {
        self.roster.borrow().viewers_of(patient_id)
    }

    /// Re-tracks with a new status and viewed patient. The roster changes
    /// when the transport echoes the update back.
    pub async fn update(
        &self,
        status: PresenceStatus,
        viewing_patient_id: Option<PatientId>,
    ) -> AppResult<()> {
        let (key, payload) = {
            let mut local = self.local();
            local.status = status;
            local.viewing_patient_id = viewing_patient_id;
            (local.key(), local.to_payload())
        };
        self.handle.track(self.track_id, &key, payload).await
    }

    /// Changes only the viewed patient.
    pub async fn set_viewing(&self, viewing_patient_id: Option<PatientId>) -> AppResult<()> {
        let status = self.local().status;
        self.update(status, viewing_patient_id).await
    }

    /// Untracks, stops the roster task and releases the channel.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.handle.untrack(self.track_id).await {
            warn!(workspace_id = %self.workspace_id, error = %e, "Presence untrack failed");
        }
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.registry.release_channel(&self.channel_name).await;
        debug!(workspace_id = %self.workspace_id, "Presence room closed");
    }
}

impl Drop for PresenceRoom {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let task = self.task.get_mut().unwrap_or_else(|e| e.into_inner()).take();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let handle = self.handle.clone();
        let track_id = self.track_id;
        let registry = self.registry.clone();
        let name = std::mem::take(&mut self.channel_name);
        runtime.spawn(async move {
            let _ = handle.untrack(track_id).await;
            if let Some(task) = task {
                let _ = task.await;
            }
            registry.release_channel(&name).await;
        });
    }
}

async fn run_roster(
    mut listener: ChannelListener,
    roster: Arc<watch::Sender<PresenceRoster>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = listener.recv() => match event {
                Some(ChannelEvent::Presence(event)) => {
                    roster.send_modify(|r| r.apply(&event));
                }
                Some(_) => {}
                None => break,
            },
        }
    }
}
