//! Bounded newest-first activity buffer.
//!
//! Order is arrival order (store-then-display): a live insert goes to the
//! head even if its `created_at` is older than what is already buffered.

use std::collections::{HashSet, VecDeque};

use carehub_core::types::UserId;

use super::types::{ActivityEvent, ActorInfo};

/// Newest-first buffer holding at most `limit` events.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityBuffer {
    items: VecDeque<ActivityEvent>,
    limit: usize,
}

impl ActivityBuffer {
    /// Creates an empty buffer.
    pub fn new(limit: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(limit),
            limit,
        }
    }

    /// Capacity.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Replaces the contents with a snapshot already ordered newest first.
    pub fn replace(&mut self, snapshot: Vec<ActivityEvent>) {
        self.items.clear();
        let mut seen = HashSet::new();
        for event in snapshot {
            if self.items.len() == self.limit {
                break;
            }
            if seen.insert(event.id) {
                self.items.push_back(event);
            }
        }
    }

    /// Inserts a live event at the head and truncates the tail.
    /// Returns `false` if an event with the same id is already buffered.
    pub fn push_front(&mut self, event: ActivityEvent) -> bool {
        if self.items.iter().any(|e| e.id == event.id) {
            return false;
        }
        self.items.push_front(event);
        self.items.truncate(self.limit);
        true
    }

    /// Attaches `actor` to every event by `user_id` that has none yet.
    /// Returns the number of events updated. Never reorders.
    pub fn set_actor(&mut self, user_id: UserId, actor: &ActorInfo) -> usize {
        let mut updated = 0;
        for event in self
            .items
            .iter_mut()
            .filter(|e| e.user_id == Some(user_id) && e.actor.is_none())
        {
            event.actor = Some(actor.clone());
            updated += 1;
        }
        updated
    }

    /// Removes every event.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Newest-first iterator.
    pub fn iter(&self) -> impl Iterator<Item = &ActivityEvent> {
        self.items.iter()
    }

    /// Newest-first copy.
    pub fn to_vec(&self) -> Vec<ActivityEvent> {
        self.items.iter().cloned().collect()
    }
}
