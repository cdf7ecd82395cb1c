//! Channel name building and parsing.
//!
//! Names follow `<purpose>:workspace:<id>[:patient:<id>]` and must stay
//! stable for the lifetime of a subscription, since the registry dedups
//! on the exact string.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use carehub_core::error::AppError;
use carehub_core::types::{PatientId, WorkspaceId};

/// What a channel carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPurpose {
    /// Activity feed inserts.
    Activity,
    /// Presence roster.
    Presence,
    /// Broadcast notifications.
    Notifications,
    /// Any other lowercase purpose token.
    Custom(String),
}

impl ChannelPurpose {
    /// Converts to the name prefix.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Activity => "activity",
            Self::Presence => "presence",
            Self::Notifications => "notifications",
            Self::Custom(s) => s,
        }
    }

    fn parse(token: &str) -> Option<Self> {
        match token {
            "activity" => Some(Self::Activity),
            "presence" => Some(Self::Presence),
            "notifications" => Some(Self::Notifications),
            other if is_valid_token(other) => Some(Self::Custom(other.to_string())),
            _ => None,
        }
    }
}

fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Typed channel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelName {
    /// Purpose prefix.
    pub purpose: ChannelPurpose,
    /// Workspace scope.
    pub workspace_id: WorkspaceId,
    /// Optional patient scope.
    pub patient_id: Option<PatientId>,
}

impl ChannelName {
    /// Workspace-scoped name.
    pub fn new(purpose: ChannelPurpose, workspace_id: WorkspaceId) -> Self {
        Self {
            purpose,
            workspace_id,
            patient_id: None,
        }
    }

    /// `activity:workspace:<id>`.
    pub fn activity(workspace_id: WorkspaceId) -> Self {
        Self::new(ChannelPurpose::Activity, workspace_id)
    }

    /// `presence:workspace:<id>`.
    pub fn presence(workspace_id: WorkspaceId) -> Self {
        Self::new(ChannelPurpose::Presence, workspace_id)
    }

    /// `notifications:workspace:<id>`.
    pub fn notifications(workspace_id: WorkspaceId) -> Self {
        Self::new(ChannelPurpose::Notifications, workspace_id)
    }

    /// Narrows the name to one patient.
    pub fn with_patient(mut self, patient_id: PatientId) -> Self {
        self.patient_id = Some(patient_id);
        self
    }

    /// Parses a channel string into a typed name.
    pub fn parse(channel: &str) -> Option<Self> {
        let parts: Vec<&str> = channel.split(':').collect();
        match parts.as_slice() {
            [purpose, "workspace", ws] => Some(Self {
                purpose: ChannelPurpose::parse(purpose)?,
                workspace_id: ws.parse().ok()?,
                patient_id: None,
            }),
            [purpose, "workspace", ws, "patient", patient] => Some(Self {
                purpose: ChannelPurpose::parse(purpose)?,
                workspace_id: ws.parse().ok()?,
                patient_id: Some(patient.parse().ok()?),
            }),
            _ => None,
        }
    }

    /// Converts back to a channel string.
    pub fn to_channel_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:workspace:{}", self.purpose.as_str(), self.workspace_id)?;
        if let Some(patient) = self.patient_id {
            write!(f, ":patient:{patient}")?;
        }
        Ok(())
    }
}

impl FromStr for ChannelName {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| AppError::validation(format!("Invalid channel name: {s}")))
    }
}
