//! Worker configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::poller::PollerConfig;
use crate::config::{
    validate_timing, ConfigError, QueueSettings, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_REAP_TIMEOUT,
};
use crate::strategy::ClaimStrategy;
use crate::util::duration_millis;

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Claim strategy
    pub strategy: ClaimStrategy,

    /// Heartbeat interval while a task executes
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Heartbeat age after which the reaper takes a task back
    #[serde(with = "duration_millis")]
    pub reap_timeout: Duration,

    /// Poller configuration
    pub poller: PollerConfig,

    /// Extra attempts at reporting a result while the store is unavailable
    pub report_retries: u32,

    /// Pause between reporting attempts
    #[serde(with = "duration_millis")]
    pub report_retry_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            strategy: ClaimStrategy::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reap_timeout: DEFAULT_REAP_TIMEOUT,
            poller: PollerConfig::default(),
            report_retries: 3,
            report_retry_delay: Duration::from_millis(500),
        }
    }
}

fn default_worker_id() -> String {
    format!("worker-{}", Uuid::now_v7())
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with stored queue settings
    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self {
            strategy: settings.strategy.clone(),
            heartbeat_interval: settings.heartbeat_interval,
            reap_timeout: settings.reap_timeout,
            ..Default::default()
        }
    }

    /// Read configuration from environment variables
    ///
    /// - `CLAIMQ_WORKER_ID`
    /// - `CLAIMQ_HEARTBEAT_INTERVAL_MS`
    /// - `CLAIMQ_REAP_TIMEOUT_MS`
    /// - `CLAIMQ_STRATEGY` (`fifo`, `lifo`, `priority`, `weighted`)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(id) = std::env::var("CLAIMQ_WORKER_ID") {
            config.worker_id = id;
        }
        if let Some(ms) = env_millis("CLAIMQ_HEARTBEAT_INTERVAL_MS")? {
            config.heartbeat_interval = ms;
        }
        if let Some(ms) = env_millis("CLAIMQ_REAP_TIMEOUT_MS")? {
            config.reap_timeout = ms;
        }
        if let Ok(strategy) = std::env::var("CLAIMQ_STRATEGY") {
            config.strategy = strategy
                .parse()
                .map_err(|e| ConfigError::invalid("CLAIMQ_STRATEGY", e))?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

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

    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_report_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.report_retries = retries;
        self.report_retry_delay = delay;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_id.trim().is_empty() {
            return Err(ConfigError::EmptyWorkerId);
        }
        validate_timing(self.heartbeat_interval, self.reap_timeout)
    }
}

fn env_millis(key: &str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| ConfigError::invalid(key, e.to_string())),
        Err(_) => Ok(None),
    }
}
