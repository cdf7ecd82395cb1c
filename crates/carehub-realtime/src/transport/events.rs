//! Event shapes delivered by the realtime transport.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of row change carried by a [`RowChange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RowChangeKind {
    /// A row was inserted.
    Insert,
    /// A row was updated.
    Update,
    /// A row was deleted.
    Delete,
}

/// A row-change event from the data collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    /// Change kind.
    pub event: RowChangeKind,
    /// Schema of the changed table.
    pub schema: String,
    /// Changed table.
    pub table: String,
    /// Row after the change (`null` for deletes).
    #[serde(default)]
    pub new: Value,
    /// Row before the change (`null` for inserts).
    #[serde(default)]
    pub old: Value,
}

impl RowChange {
    /// Builds an INSERT change.
    pub fn insert(schema: &str, table: &str, row: Value) -> Self {
        Self {
            event: RowChangeKind::Insert,
            schema: schema.to_string(),
            table: table.to_string(),
            new: row,
            old: Value::Null,
        }
    }
}

/// Subscription filter for row changes.
///
/// `filter` uses the `column=eq.value` form; only equality is supported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowChangeFilter {
    /// Change kind to receive.
    pub event: RowChangeKind,
    /// Schema to match.
    pub schema: String,
    /// Table to match.
    pub table: String,
    /// Optional column equality filter.
    pub filter: Option<String>,
}

impl RowChangeFilter {
    /// Filter for INSERTs on `schema.table`.
    pub fn inserts(schema: &str, table: &str) -> Self {
        Self {
            event: RowChangeKind::Insert,
            schema: schema.to_string(),
            table: table.to_string(),
            filter: None,
        }
    }

    /// Restricts the filter to rows where `column` equals `value`.
    pub fn eq(mut self, column: &str, value: impl std::fmt::Display) -> Self {
        self.filter = Some(format!("{column}=eq.{value}"));
        self
    }

    /// Whether `change` passes this filter.
    pub fn matches(&self, change: &RowChange) -> bool {
        if change.event != self.event || change.schema != self.schema || change.table != self.table
        {
            return false;
        }

        let Some(filter) = &self.filter else {
            return true;
        };
        let Some((column, expected)) = filter.split_once("=eq.") else {
            return false;
        };

        let row = match change.event {
            RowChangeKind::Delete => &change.old,
            _ => &change.new,
        };

        match row.get(column) {
            Some(Value::String(s)) => s == expected,
            Some(Value::Null) | None => false,
            Some(other) => other.to_string() == expected,
        }
    }
}

/// An application broadcast message relayed through a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    /// Event name chosen by the sender.
    pub event: String,
    /// Opaque payload.
    pub payload: Value,
}

/// Presence signals for a channel. Payloads are opaque JSON; the presence
/// module interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceEvent {
    /// Full presence state, keyed by presence key.
    Sync {
        /// Presence key → tracked payloads under that key.
        state: HashMap<String, Vec<Value>>,
    },
    /// One or more payloads joined under `key`.
    Join {
        /// Presence key.
        key: String,
        /// Newly tracked payloads.
        new_presences: Vec<Value>,
    },
    /// One or more payloads left under `key`.
    Leave {
        /// Presence key.
        key: String,
        /// Payloads no longer tracked.
        left_presences: Vec<Value>,
    },
}

/// Anything a channel can deliver to its listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ChannelEvent {
    /// A row change that matched one of the channel's filters.
    RowChange(RowChange),
    /// A broadcast message.
    Broadcast(BroadcastMessage),
    /// A presence signal.
    Presence(PresenceEvent),
}

/// Join lifecycle of a transport subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinState {
    /// Join requested, not yet acknowledged.
    Joining,
    /// Join acknowledged; events flow.
    Joined,
    /// Leave requested.
    Leaving,
    /// Subscription is closed.
    Closed,
    /// Transport reported a channel error.
    Errored,
}
