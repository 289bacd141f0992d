//! Task polling with exponential backoff
//!
//! Claims one task at a time. Empty polls grow the sleep through an injected
//! backoff function and a successful claim resets it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::persistence::{StoreError, TaskStore};
use crate::reliability::{Backoff, BackoffFn};
use crate::strategy::CandidateFilter;
use crate::task::Task;

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Sleep policy after empty polls and unavailable-store errors
    pub backoff: Backoff,

    /// Consecutive unavailable-store errors tolerated before giving up
    ///
    /// `None` retries forever.
    pub max_store_failures: Option<u32>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::polling(),
            max_store_failures: None,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_store_failures(mut self, max: u32) -> Self {
        self.max_store_failures = Some(max.max(1));
        self
    }
}

/// Poll counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerStats {
    pub polls_total: u64,
    pub claims_total: u64,
    pub empty_polls_total: u64,
    pub store_errors_total: u64,
}

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    /// Store error other than unavailability
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The store stayed unreachable for too many consecutive polls
    #[error("store unavailable after {failures} consecutive failures: {source}")]
    StoreUnavailable {
        failures: u32,
        #[source]
        source: StoreError,
    },
}

/// Task poller with exponential backoff
pub struct TaskPoller {
    store: Arc<dyn TaskStore>,
    worker_id: String,
    filter: CandidateFilter,
    backoff: BackoffFn,
    max_store_failures: Option<u32>,
    empty_streak: u32,
    failure_streak: u32,
    stats: PollerStats,
    shutdown: CancellationToken,
}

impl TaskPoller {
    /// Create a new task poller
    pub fn new(
        store: Arc<dyn TaskStore>,
        worker_id: impl Into<String>,
        filter: CandidateFilter,
        config: PollerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            filter,
            backoff: config.backoff.into_fn(),
            max_store_failures: config.max_store_failures,
            empty_streak: 0,
            failure_streak: 0,
            stats: PollerStats::default(),
            shutdown,
        }
    }

    /// Replace the backoff policy with an arbitrary function
    pub fn with_backoff_fn(mut self, backoff: BackoffFn) -> Self {
        self.backoff = backoff;
        self
    }

    /// Attempt one claim
    ///
    /// `Ok(None)` covers both an empty queue and a tolerated
    /// unavailable-store error; either way the next [`wait`](Self::wait)
    /// backs off further.
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn poll(&mut self) -> Result<Option<Task>, PollerError> {
        self.stats.polls_total += 1;

        match self.store.try_claim(&self.filter, &self.worker_id).await {
            Ok(Some(task)) => {
                self.stats.claims_total += 1;
                self.empty_streak = 0;
                self.failure_streak = 0;
                debug!(task_id = %task.id, attempts = task.attempts, "claimed task");
                Ok(Some(task))
            }
            Ok(None) => {
                self.stats.empty_polls_total += 1;
                self.empty_streak = self.empty_streak.saturating_add(1);
                self.failure_streak = 0;
                trace!(
                    delay_ms = self.current_delay().as_millis() as u64,
                    "no tasks found, backing off"
                );
                Ok(None)
            }
            Err(e) if e.is_unavailable() => {
                self.stats.store_errors_total += 1;
                self.failure_streak = self.failure_streak.saturating_add(1);
                if let Some(max) = self.max_store_failures {
                    if self.failure_streak >= max {
                        return Err(PollerError::StoreUnavailable {
                            failures: self.failure_streak,
                            source: e,
                        });
                    }
                }
                warn!(failures = self.failure_streak, error = %e, "store unavailable, backing off");
                Ok(None)
            }
            Err(e) => {
                self.stats.store_errors_total += 1;
                Err(PollerError::Store(e))
            }
        }
    }

    /// Sleep for the current backoff
    ///
    /// Returns `true` if shutdown was requested, possibly mid-sleep.
    pub async fn wait(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.current_delay()) => self.shutdown.is_cancelled(),
            _ = self.shutdown.cancelled() => {
                debug!("shutdown signal received during wait");
                true
            }
        }
    }

    /// Poll and wait until a task is claimed or shutdown is requested
    pub async fn next_task(&mut self) -> Result<Option<Task>, PollerError> {
        loop {
            if self.is_shutdown() {
                return Ok(None);
            }
            if let Some(task) = self.poll().await? {
                return Ok(Some(task));
            }
            if self.wait().await {
                return Ok(None);
            }
        }
    }

    /// Sleep the next [`wait`](Self::wait) will use
    pub fn current_delay(&self) -> Duration {
        (self.backoff)(self.empty_streak.max(self.failure_streak))
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn stats(&self) -> PollerStats {
        self.stats
    }

    pub fn filter(&self) -> &CandidateFilter {
        &self.filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryTaskStore;
    use crate::strategy::ClaimStrategy;
    use crate::task::NewTask;
    use serde_json::json;

    fn poller(store: Arc<dyn TaskStore>, shutdown: CancellationToken) -> TaskPoller {
        TaskPoller::new(
            store,
            "w1",
            CandidateFilter::for_type("echo", ClaimStrategy::Fifo),
            PollerConfig::default(),
            shutdown,
        )
        .with_backoff_fn(Arc::new(|step| Duration::from_millis(u64::from(step) * 10)))
    }

    #[test]
    fn test_default_config() {
        let config = PollerConfig::default();
        assert_eq!(config.backoff, Backoff::polling());
        assert_eq!(config.max_store_failures, None);
        assert_eq!(
            PollerConfig::new().with_max_store_failures(0).max_store_failures,
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_empty_polls_grow_delay_and_claim_resets() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let mut poller = poller(store.clone(), CancellationToken::new());

        assert_eq!(poller.current_delay(), Duration::ZERO);
        assert!(poller.poll().await.unwrap().is_none());
        assert!(poller.poll().await.unwrap().is_none());
        assert_eq!(poller.current_delay(), Duration::from_millis(20));

        store.enqueue(NewTask::new("echo", json!({}))).await.unwrap();
        assert!(poller.poll().await.unwrap().is_some());
        assert_eq!(poller.current_delay(), Duration::ZERO);

        let stats = poller.stats();
        assert_eq!(stats.polls_total, 3);
        assert_eq!(stats.claims_total, 1);
        assert_eq!(stats.empty_polls_total, 2);
        assert_eq!(stats.store_errors_total, 0);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_wait() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let shutdown = CancellationToken::new();
        let mut poller = poller(store, shutdown.clone())
            .with_backoff_fn(Arc::new(|_| Duration::from_secs(3600)));

        let handle = tokio::spawn(async move { poller.next_task().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_next_task_returns_claim() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        store.enqueue(NewTask::new("echo", json!({"n": 1}))).await.unwrap();
        let mut poller = poller(store, CancellationToken::new());

        let task = poller.next_task().await.unwrap().unwrap();
        assert_eq!(task.payload, json!({"n": 1}));
        assert_eq!(task.claimed_by.as_deref(), Some("w1"));
    }
}
