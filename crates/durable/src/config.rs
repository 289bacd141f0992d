//! Queue-wide settings persisted in the store's settings table
//!
//! Resolution order for a running worker: explicit flag, then the stored
//! [`QueueSettings`], then the built-in defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::persistence::{StoreError, TaskStore};
use crate::strategy::ClaimStrategy;
use crate::util::duration_millis;

/// Settings-table key holding [`QueueSettings`]
pub const QUEUE_SETTINGS_KEY: &str = "queue";

/// Default interval between heartbeats of a claimed task
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default heartbeat age after which the reaper requeues a task
pub const DEFAULT_REAP_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable or flag could not be parsed
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Heartbeats would not arrive often enough to keep a claim alive
    #[error(
        "heartbeat interval {heartbeat_ms}ms must be less than a third of the reap timeout {reap_timeout_ms}ms"
    )]
    HeartbeatTooSlow {
        heartbeat_ms: u128,
        reap_timeout_ms: u128,
    },

    /// A duration that must be positive was zero
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    /// Worker id was empty
    #[error("worker id must not be empty")]
    EmptyWorkerId,

    /// Settings could not be read or written
    #[error("settings store error: {0}")]
    Store(#[from] StoreError),

    /// Stored settings did not deserialize
    #[error("malformed stored settings: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Check the heartbeat/reap-timeout ratio
///
/// A holder must be able to miss two heartbeats without being reaped.
pub fn validate_timing(heartbeat_interval: Duration, reap_timeout: Duration) -> Result<(), ConfigError> {
    if heartbeat_interval.is_zero() {
        return Err(ConfigError::ZeroDuration("heartbeat interval"));
    }
    if reap_timeout.is_zero() {
        return Err(ConfigError::ZeroDuration("reap timeout"));
    }
    if heartbeat_interval * 3 >= reap_timeout {
        return Err(ConfigError::HeartbeatTooSlow {
            heartbeat_ms: heartbeat_interval.as_millis(),
            reap_timeout_ms: reap_timeout.as_millis(),
        });
    }
    Ok(())
}

/// Queue settings shared by every worker and reaper of a deployment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueSettings {
    #[serde(default)]
    pub strategy: ClaimStrategy,

    #[serde(with = "duration_millis", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,

    #[serde(with = "duration_millis", default = "default_reap_timeout")]
    pub reap_timeout: Duration,
}

fn default_heartbeat_interval() -> Duration {
    DEFAULT_HEARTBEAT_INTERVAL
}

fn default_reap_timeout() -> Duration {
    DEFAULT_REAP_TIMEOUT
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            strategy: ClaimStrategy::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reap_timeout: DEFAULT_REAP_TIMEOUT,
        }
    }
}

impl QueueSettings {
    pub fn with_strategy(mut self, strategy: ClaimStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_reap_timeout(mut self, timeout: Duration) -> Self {
        self.reap_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_timing(self.heartbeat_interval, self.reap_timeout)
    }

    /// Load stored settings, or the defaults when none were saved
    pub async fn load(store: &dyn TaskStore) -> Result<Self, ConfigError> {
        match store.get_setting(QUEUE_SETTINGS_KEY).await? {
            Some(value) => {
                let settings: Self = serde_json::from_value(value)?;
                debug!(strategy = %settings.strategy, "loaded queue settings");
                Ok(settings)
            }
            None => Ok(Self::default()),
        }
    }

    /// Validate and persist
    pub async fn save(&self, store: &dyn TaskStore) -> Result<(), ConfigError> {
        self.validate()?;
        store
            .put_setting(QUEUE_SETTINGS_KEY, serde_json::to_value(self)?)
            .await?;
        Ok(())
    }
}
