//! Data collaborators for the activity feed: the snapshot source and the
//! profile directory used for actor enrichment.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use carehub_core::error::AppError;
use carehub_core::result::AppResult;
use carehub_core::types::{UserId, WorkspaceId};

use super::types::{ActivityEvent, ActorInfo};

/// Source of activity snapshots.
#[async_trait]
pub trait ActivityStore: Send + Sync + std::fmt::Debug + 'static {
    /// The most recent `limit` activities of `workspace_id`, newest first.
    async fn recent_activities(
        &self,
        workspace_id: WorkspaceId,
        limit: usize,
    ) -> AppResult<Vec<ActivityEvent>>;
}

/// Batch lookup of user profiles.
#[async_trait]
pub trait ProfileDirectory: Send + Sync + std::fmt::Debug + 'static {
    /// Resolves the given users. Unknown users are absent from the result.
    async fn lookup_profiles(&self, user_ids: &[UserId]) -> AppResult<HashMap<UserId, ActorInfo>>;
}

/// In-memory activity table.
#[derive(Debug, Default)]
pub struct MemoryActivityStore {
    rows: Mutex<Vec<ActivityEvent>>,
    failing: AtomicBool,
    reads: AtomicU32,
}

impl MemoryActivityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a row. The actor is never persisted.
    pub fn insert(&self, mut event: ActivityEvent) {
        event.actor = None;
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }

    /// Makes snapshot reads fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of snapshot reads served or failed.
    pub fn read_count(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActivityStore for MemoryActivityStore {
    async fn recent_activities(
        &self,
        workspace_id: WorkspaceId,
        limit: usize,
    ) -> AppResult<Vec<ActivityEvent>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::external("Activity snapshot read failed"));
        }

        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let mut recent: Vec<ActivityEvent> = rows
            .iter()
            .filter(|e| e.workspace_id == workspace_id)
            .cloned()
            .collect();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        recent.truncate(limit);
        Ok(recent)
    }
}

/// In-memory profile directory.
#[derive(Debug, Default)]
pub struct MemoryProfileDirectory {
    profiles: Mutex<HashMap<UserId, ActorInfo>>,
    failing: AtomicBool,
    lookups: AtomicU32,
}

impl MemoryProfileDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a profile.
    pub fn insert(&self, user_id: UserId, actor: ActorInfo) {
        self.profiles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_id, actor);
    }

    /// Makes lookups fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of batch lookups performed.
    pub fn lookup_count(&self) -> u32 {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProfileDirectory for MemoryProfileDirectory {
    async fn lookup_profiles(&self, user_ids: &[UserId]) -> AppResult<HashMap<UserId, ActorInfo>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::external("Profile lookup failed"));
        }

        let profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
        Ok(user_ids
            .iter()
            .filter_map(|id| profiles.get(id).map(|p| (*id, p.clone())))
            .collect())
    }
}
