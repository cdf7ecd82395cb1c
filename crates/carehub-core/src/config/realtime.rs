//! Realtime synchronization configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Realtime synchronization layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Interval between liveness probes while connected, in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    /// Reconnection scheduling used by the connection health manager.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Retry policy applied to channel subscription setup.
    #[serde(default)]
    pub subscribe_retry: SubscribeRetryConfig,
    /// Per-subscription event queue and per-channel fan-out buffer size.
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer_size: usize,
    /// Activity feed settings.
    #[serde(default)]
    pub activity: ActivityConfig,
}

/// Exponential reconnect backoff for the health manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Maximum scheduled reconnect attempts before giving up.
    #[serde(default = "default_reconnect_attempts")]
    pub max_attempts: u32,
    /// Delay before the first attempt; doubled for each further attempt.
    #[serde(default = "default_reconnect_base_delay")]
    pub base_delay_ms: u64,
}

/// Retry policy for channel joins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRetryConfig {
    /// Total attempts, including the first one.
    #[serde(default = "default_subscribe_attempts")]
    pub max_attempts: u32,
    /// Sleep after the first failed attempt.
    #[serde(default = "default_subscribe_delay")]
    pub delay_ms: u64,
    /// Growth factor applied to the sleep after each failure.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

/// Activity feed settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityConfig {
    /// Buffer capacity and snapshot size.
    #[serde(default = "default_activity_limit")]
    pub limit: usize,
    /// Debounce window for batching actor lookups on live inserts.
    #[serde(default = "default_enrichment_window")]
    pub enrichment_window_ms: u64,
    /// Maximum cached actor profiles per engine.
    #[serde(default = "default_actor_cache_capacity")]
    pub actor_cache_capacity: u64,
    /// Time-to-live of a cached actor profile, in seconds.
    #[serde(default = "default_actor_cache_ttl")]
    pub actor_cache_ttl_seconds: u64,
}

impl RealtimeConfig {
    /// Heartbeat interval as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    /// Rejects values that would make the timers or buffers degenerate.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.heartbeat_interval_seconds == 0 {
            return Err(AppError::configuration(
                "realtime.heartbeat_interval_seconds must be greater than zero",
            ));
        }
        if self.channel_buffer_size == 0 {
            return Err(AppError::configuration(
                "realtime.channel_buffer_size must be greater than zero",
            ));
        }
        if self.subscribe_retry.max_attempts == 0 {
            return Err(AppError::configuration(
                "realtime.subscribe_retry.max_attempts must be at least 1",
            ));
        }
        if self.subscribe_retry.backoff_multiplier < 1.0 {
            return Err(AppError::configuration(
                "realtime.subscribe_retry.backoff_multiplier must be >= 1.0",
            ));
        }
        if self.activity.limit == 0 {
            return Err(AppError::configuration(
                "realtime.activity.limit must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: default_heartbeat_interval(),
            reconnect: ReconnectConfig::default(),
            subscribe_retry: SubscribeRetryConfig::default(),
            channel_buffer_size: default_channel_buffer(),
            activity: ActivityConfig::default(),
        }
    }
}

impl ReconnectConfig {
    /// Base delay as a [`Duration`].
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_reconnect_attempts(),
            base_delay_ms: default_reconnect_base_delay(),
        }
    }
}

impl Default for SubscribeRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_subscribe_attempts(),
            delay_ms: default_subscribe_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl ActivityConfig {
    /// Enrichment debounce window as a [`Duration`].
    pub fn enrichment_window(&self) -> Duration {
        Duration::from_millis(self.enrichment_window_ms)
    }

    /// Actor cache TTL as a [`Duration`].
    pub fn actor_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.actor_cache_ttl_seconds)
    }
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            limit: default_activity_limit(),
            enrichment_window_ms: default_enrichment_window(),
            actor_cache_capacity: default_actor_cache_capacity(),
            actor_cache_ttl_seconds: default_actor_cache_ttl(),
        }
    }
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base_delay() -> u64 {
    2000
}

fn default_subscribe_attempts() -> u32 {
    3
}

fn default_subscribe_delay() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_channel_buffer() -> usize {
    256
}

fn default_activity_limit() -> usize {
    50
}

fn default_enrichment_window() -> u64 {
    100
}

fn default_actor_cache_capacity() -> u64 {
    1000
}

fn default_actor_cache_ttl() -> u64 {
    300
}
