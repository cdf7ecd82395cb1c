//! Actor enrichment: batched profile lookups behind a moka cache.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use moka::future::Cache;
use tracing::{debug, warn};

use carehub_core::config::ActivityConfig;
use carehub_core::types::UserId;

use crate::metrics::EngineMetrics;

use super::store::ProfileDirectory;
use super::types::ActorInfo;

/// Resolves user ids to [`ActorInfo`], shared by every feed of an engine.
#[derive(Clone)]
pub struct ActorResolver {
    directory: Arc<dyn ProfileDirectory>,
    cache: Cache<UserId, ActorInfo>,
    metrics: Arc<EngineMetrics>,
}

impl std::fmt::Debug for ActorResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorResolver")
            .field("directory", &self.directory)
            .field("cached", &self.cache.entry_count())
            .finish()
    }
}

impl ActorResolver {
    /// Creates a resolver with the configured cache bounds.
    pub fn new(
        directory: Arc<dyn ProfileDirectory>,
        config: &ActivityConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.actor_cache_capacity)
            .time_to_live(config.actor_cache_ttl())
            .build();

        Self {
            directory,
            cache,
            metrics,
        }
    }

    /// Resolves `user_ids` with at most one directory call for the cache
    /// misses. A failed lookup is logged and yields no entries.
    pub async fn resolve_many(&self, user_ids: &[UserId]) -> HashMap<UserId, ActorInfo> {
        let mut resolved = HashMap::new();
        let mut misses = Vec::new();
        let mut seen = HashSet::new();

        for id in user_ids.iter().copied().filter(|id| seen.insert(*id)) {
            match self.cache.get(&id).await {
                Some(actor) => {
                    resolved.insert(id, actor);
                }
                None => misses.push(id),
            }
        }

        if misses.is_empty() {
            return resolved;
        }

        EngineMetrics::inc(&self.metrics.actor_lookups);
        match self.directory.lookup_profiles(&misses).await {
            Ok(found) => {
                debug!(
                    requested = misses.len(),
                    found = found.len(),
                    "Resolved activity actors"
                );
                for (id, actor) in found {
                    self.cache.insert(id, actor.clone()).await;
                    resolved.insert(id, actor);
                }
            }
            Err(e) => {
                warn!(error = %e, users = misses.len(), "Actor lookup failed, continuing without actor info");
            }
        }
        resolved
    }

    /// Drops a cached profile so the next resolve hits the directory.
    pub async fn invalidate(&self, user_id: UserId) {
        self.cache.invalidate(&user_id).await;
    }
}
