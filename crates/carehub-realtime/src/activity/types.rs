//! Activity event model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use carehub_core::result::AppResult;
use carehub_core::types::{ActivityId, UserId, WorkspaceId};

/// Recognized activity kinds. Values are only ever added, never repurposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    PatientCreated,
    PatientUpdated,
    PatientDeleted,
    PatientViewed,
    PatientAssigned,
    DataAdded,
    DataUpdated,
    TestAdded,
    AiAnalysisRequested,
    AiAnalysisCompleted,
    ChatMessageSent,
    NoteCreated,
    NoteUpdated,
    WorkspaceJoined,
    WorkspaceLeft,
    MemberInvited,
    MemberRemoved,
    SettingsUpdated,
    /// A value this build does not know yet.
    #[serde(other)]
    Unknown,
}

impl ActivityType {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PatientCreated => "patient_created",
            Self::PatientUpdated => "patient_updated",
            Self::PatientDeleted => "patient_deleted",
            Self::PatientViewed => "patient_viewed",
            Self::PatientAssigned => "patient_assigned",
            Self::DataAdded => "data_added",
            Self::DataUpdated => "data_updated",
            Self::TestAdded => "test_added",
            Self::AiAnalysisRequested => "ai_analysis_requested",
            Self::AiAnalysisCompleted => "ai_analysis_completed",
            Self::ChatMessageSent => "chat_message_sent",
            Self::NoteCreated => "note_created",
            Self::NoteUpdated => "note_updated",
            Self::WorkspaceJoined => "workspace_joined",
            Self::WorkspaceLeft => "workspace_left",
            Self::MemberInvited => "member_invited",
            Self::MemberRemoved => "member_removed",
            Self::SettingsUpdated => "settings_updated",
            Self::Unknown => "unknown",
        }
    }
}

/// Display information about the user behind an activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorInfo {
    /// Full display name.
    pub full_name: String,
    /// Avatar URL.
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Job title.
    #[serde(default)]
    pub title: Option<String>,
}

/// One row of the activity feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: ActivityId,
    pub workspace_id: WorkspaceId,
    #[serde(default)]
    pub user_id: Option<UserId>,
    pub activity_type: ActivityType,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
    /// Resolved actor; absent until enrichment succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<ActorInfo>,
}

impl ActivityEvent {
    /// Creates an event stamped now.
    pub fn new(
        workspace_id: WorkspaceId,
        user_id: Option<UserId>,
        activity_type: ActivityType,
    ) -> Self {
        Self {
            id: ActivityId::new(),
            workspace_id,
            user_id,
            activity_type,
            description: None,
            created_at: Utc::now(),
            metadata: Value::Null,
            actor: None,
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Decodes an `activities` row as delivered in a row change.
    pub fn from_row(row: &Value) -> AppResult<Self> {
        Ok(serde_json::from_value(row.clone())?)
    }

    /// Encodes as an `activities` row, without the actor.
    pub fn to_row(&self) -> Value {
        let mut row = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut row {
            map.remove("actor");
        }
        row
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_decodes_insert_row() {
        let ws = WorkspaceId::new();
        let user = UserId::new();
        let row = json!({
            "id": ActivityId::new(),
            "workspace_id": ws,
            "user_id": user,
            "activity_type": "patient_created",
            "created_at": "2026-01-05T10:00:00Z",
        });

        let event = ActivityEvent::from_row(&row).unwrap();
        assert_eq!(event.workspace_id, ws);
        assert_eq!(event.user_id, Some(user));
        assert_eq!(event.activity_type, ActivityType::PatientCreated);
        assert!(event.actor.is_none());
        assert!(event.metadata.is_null());
    }

    #[test]
    fn test_unknown_type_is_kept() {
        let row = json!({
            "id": ActivityId::new(),
            "workspace_id": WorkspaceId::new(),
            "activity_type": "care_plan_signed",
            "created_at": "2026-01-05T10:00:00Z",
        });
        let event = ActivityEvent::from_row(&row).unwrap();
        assert_eq!(event.activity_type, ActivityType::Unknown);
        assert!(event.user_id.is_none());
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&ActivityType::AiAnalysisCompleted).unwrap(),
            "\"ai_analysis_completed\""
        );
        assert_eq!(ActivityType::SettingsUpdated.as_str(), "settings_updated");
    }

    #[test]
    fn test_row_omits_actor() {
        let mut event = ActivityEvent::new(WorkspaceId::new(), None, ActivityType::NoteCreated);
        event.actor = Some(ActorInfo {
            full_name: "Dr. Ada".into(),
            avatar_url: None,
            title: None,
        });
        assert!(event.to_row().get("actor").is_none());
    }

    #[test]
    fn test_malformed_row_is_an_error() {
        assert!(ActivityEvent::from_row(&json!({"id": "nope"})).is_err());
    }
}
