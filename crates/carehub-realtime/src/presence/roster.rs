//! Presence records and the per-workspace roster.
//!
//! The roster is keyed by user and only changes in response to transport
//! presence events. Grouping by status is derived on read.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

use carehub_core::types::{PatientId, UserId, WorkspaceId};

use crate::transport::PresenceEvent;

use super::status::PresenceStatus;

fn lenient_status<'de, D>(deserializer: D) -> Result<PresenceStatus, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(PresenceStatus::from_str_or_default(&s))
}

/// One session's presence payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub workspace_id: WorkspaceId,
    #[serde(default, deserialize_with = "lenient_status")]
    pub status: PresenceStatus,
    /// Patient currently open in this session.
    #[serde(default)]
    pub viewing_patient_id: Option<PatientId>,
    pub online_at: DateTime<Utc>,
}

impl PresenceRecord {
    /// A fresh `online` record stamped now.
    pub fn new(user_id: UserId, workspace_id: WorkspaceId) -> Self {
        Self {
            user_id,
            workspace_id,
            status: PresenceStatus::Online,
            viewing_patient_id: None,
            online_at: Utc::now(),
        }
    }

    /// Sets the status.
    pub fn with_status(mut self, status: PresenceStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the patient being viewed.
    pub fn viewing(mut self, patient_id: PatientId) -> Self {
        self.viewing_patient_id = Some(patient_id);
        self
    }

    /// Presence key used on the transport.
    pub fn key(&self) -> String {
        self.user_id.to_string()
    }

    /// Encodes as a transport payload.
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Decodes a transport payload.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        match serde_json::from_value(payload.clone()) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!(error = %e, "Ignoring malformed presence payload");
                None
            }
        }
    }
}

/// Who is present in one workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRoster {
    workspace_id: WorkspaceId,
    members: HashMap<UserId, PresenceRecord>,
}

impl PresenceRoster {
    /// Creates an empty roster.
    pub fn new(workspace_id: WorkspaceId) -> Self {
        Self {
            workspace_id,
            members: HashMap::new(),
        }
    }

    /// Applies one transport presence event.
    pub fn apply(&mut self, event: &PresenceEvent) {
        match event {
            PresenceEvent::Sync { state } => self.apply_sync(state),
            PresenceEvent::Join { key, new_presences } => self.apply_join(key, new_presences),
            PresenceEvent::Leave {
                key,
                left_presences,
            } => self.apply_leave(key, left_presences),
        }
    }

    /// Replaces the whole roster.
    pub fn apply_sync(&mut self, state: &HashMap<String, Vec<Value>>) {
        self.members.clear();
        for payloads in state.values() {
            for record in self.decode_all(payloads) {
                self.upsert_latest(record);
            }
        }
    }

    /// Upserts the records of one join.
    pub fn apply_join(&mut self, key: &str, new_presences: &[Value]) {
        let mut joined: HashMap<UserId, PresenceRecord> = HashMap::new();
        for record in self.decode_all(new_presences) {
            match joined.get(&record.user_id) {
                Some(existing) if existing.online_at > record.online_at => {}
                _ => {
                    joined.insert(record.user_id, record);
                }
            }
        }
        debug!(key, joined = joined.len(), "Presence join");
        self.members.extend(joined);
    }

    /// Removes the user behind `key`, and any user named in `left_presences`.
    pub fn apply_leave(&mut self, key: &str, left_presences: &[Value]) {
        if let Ok(user_id) = key.parse::<UserId>() {
            self.members.remove(&user_id);
        }
        for payload in left_presences {
            if let Some(record) = PresenceRecord::from_payload(payload) {
                self.members.remove(&record.user_id);
            }
        }
    }

    fn decode_all(&self, payloads: &[Value]) -> Vec<PresenceRecord> {
        payloads
            .iter()
            .filter_map(PresenceRecord::from_payload)
            .filter(|r| r.workspace_id == self.workspace_id)
            .collect()
    }

    fn upsert_latest(&mut self, record: PresenceRecord) {
        match self.members.get(&record.user_id) {
            Some(existing) if existing.online_at > record.online_at => {}
            _ => {
                self.members.insert(record.user_id, record);
            }
        }
    }

    /// Workspace this roster belongs to.
    pub fn workspace_id(&self) -> WorkspaceId {
        self.workspace_id
    }

    /// The latest record for `user_id`.
    pub fn get(&self, user_id: UserId) -> Option<&PresenceRecord> {
        self.members.get(&user_id)
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.members.contains_key(&user_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// All records, earliest `online_at` first.
    pub fn members(&self) -> Vec<PresenceRecord> {
        let mut members: Vec<PresenceRecord> = self.members.values().cloned().collect();
        members.sort_by(|a, b| {
            a.online_at
                .cmp(&b.online_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        members
    }

    /// Records grouped by status.
    pub fn grouped(&self) -> BTreeMap<PresenceStatus, Vec<PresenceRecord>> {
        let mut groups: BTreeMap<PresenceStatus, Vec<PresenceRecord>> = BTreeMap::new();
        for record in self.members() {
            groups.entry(record.status).or_default().push(record);
        }
        groups
    }

    /// Users whose session is viewing `patient_id`.
    pub fn viewers_of(&self, patient_id: PatientId) -> Vec<UserId> {
        self.members()
            .into_iter()
            .filter(|r| r.viewing_patient_id == Some(patient_id))
            .map(|r| r.user_id)
            .collect()
    }
}
