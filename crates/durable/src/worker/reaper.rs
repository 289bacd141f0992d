//! Stale claim recovery
//!
//! A claimed task whose heartbeat is older than the reap timeout belongs to a
//! worker that crashed or stalled. The reaper hands it back to the queue, or
//! fails it when no attempts remain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConfigError, QueueSettings, DEFAULT_REAP_TIMEOUT};
use crate::persistence::{ReapOutcome, StoreError, TaskStore};
use crate::util::duration_millis;

/// Reaper configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Time between sweeps
    #[serde(with = "duration_millis")]
    pub interval: Duration,

    /// Heartbeat age after which a claim is stale
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            timeout: DEFAULT_REAP_TIMEOUT,
        }
    }
}

impl ReaperConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sweep four times per reap timeout
    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self {
            interval: settings.reap_timeout / 4,
            timeout: settings.reap_timeout,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::ZeroDuration("reaper interval"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("reap timeout"));
        }
        Ok(())
    }
}

/// Reaper counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaperStats {
    pub sweeps_total: u64,
    pub requeued_total: u64,
    pub failed_total: u64,
    pub errors_total: u64,
}

#[derive(Default)]
struct Counters {
    sweeps: AtomicU64,
    requeued: AtomicU64,
    failed: AtomicU64,
    errors: AtomicU64,
}

/// Periodically requeues stale claims
///
/// Any number of reapers may run against the same store; each stale task is
/// moved by exactly one of them.
#[derive(Clone)]
pub struct Reaper {
    store: Arc<dyn TaskStore>,
    config: ReaperConfig,
    counters: Arc<Counters>,
}

impl Reaper {
    pub fn new(store: Arc<dyn TaskStore>, config: ReaperConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    pub fn stats(&self) -> ReaperStats {
        ReaperStats {
            sweeps_total: self.counters.sweeps.load(Ordering::Relaxed),
            requeued_total: self.counters.requeued.load(Ordering::Relaxed),
            failed_total: self.counters.failed.load(Ordering::Relaxed),
            errors_total: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    /// Run one sweep
    #[instrument(skip(self), fields(timeout_ms = self.config.timeout.as_millis() as u64))]
    pub async fn sweep(&self) -> Result<ReapOutcome, StoreError> {
        self.counters.sweeps.fetch_add(1, Ordering::Relaxed);

        let outcome = match self.store.reap_stale(self.config.timeout).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        self.counters
            .requeued
            .fetch_add(outcome.requeued.len() as u64, Ordering::Relaxed);
        self.counters
            .failed
            .fetch_add(outcome.failed.len() as u64, Ordering::Relaxed);

        if !outcome.requeued.is_empty() {
            info!(count = outcome.requeued.len(), task_ids = ?outcome.requeued, "Requeued stale tasks");
        }
        if !outcome.failed.is_empty() {
            warn!(count = outcome.failed.len(), task_ids = ?outcome.failed, "Failed stale tasks with no attempts left");
        }
        Ok(outcome)
    }

    /// Sweep every interval until `shutdown` is cancelled
    ///
    /// Sweep errors are logged and the loop keeps going.
    pub async fn run(&self, shutdown: CancellationToken) -> ReaperStats {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            timeout_ms = self.config.timeout.as_millis() as u64,
            "Starting reaper"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!("Stale task sweep failed: {}", e);
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("Reaper: shutdown requested");
                    break;
                }
            }
        }

        let stats = self.stats();
        info!(
            sweeps = stats.sweeps_total,
            requeued = stats.requeued_total,
            failed = stats.failed_total,
            "Reaper stopped"
        );
        stats
    }

    /// Run on a background task
    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<ReaperStats> {
        let reaper = self.clone();
        tokio::spawn(async move { reaper.run(shutdown).await })
    }
}
