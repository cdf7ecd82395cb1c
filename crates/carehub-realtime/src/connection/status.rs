//! Connection status vocabulary shared by the health manager and channels.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use carehub_core::error::AppError;

use crate::transport::JoinState;

/// Coarse-grained connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Not connected; a reconnect may be pending.
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// Connected and healthy.
    Connected,
    /// Failed; either a reconnect is pending or attempts are exhausted.
    Error,
}

impl ConnectionStatus {
    /// Converts to string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }

    /// Whether the health manager may move from `self` to `next`.
    ///
    /// Allowed edges: `disconnected→connecting→connected`,
    /// `connected→{disconnected,error}`, `{disconnected,error}→connecting`,
    /// a failed attempt `connecting→{disconnected,error}`, and exhaustion
    /// `disconnected→error`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Error)
                | (Connected, Disconnected)
                | (Connected, Error)
                | (Disconnected, Error)
                | (Error, Connecting)
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<JoinState> for ConnectionStatus {
    fn from(state: JoinState) -> Self {
        match state {
            JoinState::Joining => Self::Connecting,
            JoinState::Joined => Self::Connected,
            JoinState::Leaving | JoinState::Closed => Self::Disconnected,
            JoinState::Errored => Self::Error,
        }
    }
}

/// Snapshot of the health manager's state.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    /// Current status.
    pub status: ConnectionStatus,
    /// When `connected` was last entered.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Reconnect attempts scheduled since the connection last fully
    /// recovered (probe and channel resubscription both succeeded).
    pub reconnect_attempts: u32,
    /// Most recent failure.
    pub last_error: Option<AppError>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            last_connected_at: None,
            reconnect_attempts: 0,
            last_error: None,
        }
    }
}

/// Observable health-manager events, in transition order.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    /// The status changed.
    StatusChanged {
        /// Previous status.
        from: ConnectionStatus,
        /// New status.
        to: ConnectionStatus,
    },
    /// Reconnect attempt `attempt` was scheduled to run after `delay`.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
        /// Backoff before the attempt.
        delay: Duration,
    },
    /// The connection recovered after a failure or a forced reconnect.
    Reconnected,
}
