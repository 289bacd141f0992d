//! Single-task worker lifecycle
//!
//! `Idle → Claiming → Executing → Reporting → Idle`, until shutdown moves the
//! worker to `Stopped`. One task runs at a time; scale out by running more
//! workers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::config::WorkerConfig;
use super::executor::{ExecutionResult, Executor};
use super::poller::{PollerError, PollerStats, TaskPoller};
use crate::config::ConfigError;
use crate::persistence::{Completion, FailureOutcome, StoreError, TaskStore};
use crate::reliability::BackoffFn;
use crate::remote::RemoteReporter;
use crate::strategy::CandidateFilter;
use crate::task::{validate_task_type, ExecutionError, Task, TaskId};

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Claiming,
    Executing,
    Reporting,
    Stopped,
}

/// What happened to one claimed task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Marked completed
    Completed,
    /// Failed with attempts left; back to pending
    Requeued,
    /// Failed terminally (fatal error or attempts exhausted)
    Terminated,
    /// The claim had already been taken away; the result was discarded
    OwnershipLost,
    /// The store stayed unavailable while reporting; the task is left claimed
    /// for the reaper
    Unreported,
}

/// Worker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub completed: u64,
    pub requeued: u64,
    pub terminated: u64,
    pub ownership_lost: u64,
    pub unreported: u64,
    pub heartbeats_sent: u64,
    pub poller: PollerStats,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    requeued: AtomicU64,
    terminated: AtomicU64,
    ownership_lost: AtomicU64,
    unreported: AtomicU64,
    heartbeats_sent: AtomicU64,
}

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Store error that is not a transient outage
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Poller gave up
    #[error("poller error: {0}")]
    Poller(#[from] PollerError),

    /// Invalid configuration
    #[error("invalid worker configuration: {0}")]
    Config(#[from] ConfigError),
}

impl WorkerError {
    /// Whether the worker stopped because the store could not be reached
    pub fn is_store_unavailable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_unavailable(),
            Self::Poller(PollerError::StoreUnavailable { .. }) => true,
            Self::Poller(PollerError::Store(e)) => e.is_unavailable(),
            Self::Config(_) => false,
        }
    }
}

/// Claims and executes tasks of one type
///
/// # Example
///
/// ```ignore
/// use claimq_durable::prelude::*;
///
/// let worker = Worker::new(store, "echo", executor_fn(|t| async move { Ok(t.payload) }),
///     WorkerConfig::default())?;
/// let shutdown = CancellationToken::new();
/// worker.run(shutdown.clone()).await?;
/// ```
pub struct Worker {
    store: Arc<dyn TaskStore>,
    executor: Arc<dyn Executor>,
    task_type: String,
    config: WorkerConfig,
    reporter: Option<RemoteReporter>,
    poll_backoff: Option<BackoffFn>,
    state: Mutex<WorkerState>,
    counters: Arc<Counters>,
    poller_stats: Mutex<PollerStats>,
}

impl Worker {
    /// Create a worker; fails on invalid configuration
    pub fn new(
        store: Arc<dyn TaskStore>,
        task_type: impl Into<String>,
        executor: Arc<dyn Executor>,
        config: WorkerConfig,
    ) -> Result<Self, WorkerError> {
        let task_type = task_type.into();
        validate_task_type(&task_type).map_err(|e| ConfigError::invalid("task_type", e))?;
        config.validate()?;

        Ok(Self {
            store,
            executor,
            task_type,
            config,
            reporter: None,
            poll_backoff: None,
            state: Mutex::new(WorkerState::Idle),
            counters: Arc::new(Counters::default()),
            poller_stats: Mutex::new(PollerStats::default()),
        })
    }

    /// Mirror claims and completions to a remote registry
    pub fn with_reporter(mut self, reporter: RemoteReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Override the poller's backoff function
    pub fn with_poll_backoff(mut self, backoff: BackoffFn) -> Self {
        self.poll_backoff = Some(backoff);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            completed: self.counters.completed.load(Ordering::Relaxed),
            requeued: self.counters.requeued.load(Ordering::Relaxed),
            terminated: self.counters.terminated.load(Ordering::Relaxed),
            ownership_lost: self.counters.ownership_lost.load(Ordering::Relaxed),
            unreported: self.counters.unreported.load(Ordering::Relaxed),
            heartbeats_sent: self.counters.heartbeats_sent.load(Ordering::Relaxed),
            poller: *self.poller_stats.lock(),
        }
    }

    fn filter(&self) -> CandidateFilter {
        CandidateFilter::for_type(self.task_type.clone(), self.config.strategy.clone())
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock() = state;
    }

    /// Claim and process tasks until `shutdown` is cancelled
    ///
    /// Shutdown stops claiming; a task already executing runs to completion
    /// and is reported before this returns.
    #[instrument(skip(self, shutdown), fields(worker_id = %self.config.worker_id, task_type = %self.task_type))]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<WorkerStats, WorkerError> {
        info!(
            strategy = %self.config.strategy,
            heartbeat_ms = self.config.heartbeat_interval.as_millis() as u64,
            "starting worker"
        );

        let mut poller = TaskPoller::new(
            Arc::clone(&self.store),
            self.config.worker_id.clone(),
            self.filter(),
            self.config.poller.clone(),
            shutdown,
        );
        if let Some(backoff) = &self.poll_backoff {
            poller = poller.with_backoff_fn(Arc::clone(backoff));
        }

        let result = loop {
            self.set_state(WorkerState::Claiming);
            let next = poller.next_task().await;
            *self.poller_stats.lock() = poller.stats();

            let task = match next {
                Ok(Some(task)) => task,
                Ok(None) => break Ok(()),
                Err(e) => break Err(WorkerError::from(e)),
            };

            if let Err(e) = self.process(task).await {
                break Err(e);
            }
        };

        self.set_state(WorkerState::Stopped);
        match result {
            Ok(()) => {
                let stats = self.stats();
                info!(
                    completed = stats.completed,
                    requeued = stats.requeued,
                    terminated = stats.terminated,
                    "worker stopped"
                );
                Ok(stats)
            }
            Err(e) => {
                error!(error = %e, "worker stopped on error");
                Err(e)
            }
        }
    }

    /// Claim at most one task and process it
    pub async fn run_once(&self) -> Result<Option<TaskOutcome>, WorkerError> {
        self.set_state(WorkerState::Claiming);
        let claimed = self
            .store
            .try_claim(&self.filter(), &self.config.worker_id)
            .await;

        let task = match claimed {
            Ok(Some(task)) => task,
            Ok(None) => {
                self.set_state(WorkerState::Idle);
                return Ok(None);
            }
            Err(e) => {
                self.set_state(WorkerState::Idle);
                return Err(e.into());
            }
        };
        self.process(task).await.map(Some)
    }

    /// Execute an already claimed task and report its result
    #[instrument(skip(self, task), fields(worker_id = %self.config.worker_id, task_id = %task.id, attempt = task.attempts))]
    pub async fn process(&self, task: Task) -> Result<TaskOutcome, WorkerError> {
        if let Some(reporter) = &self.reporter {
            reporter.task_claimed(task.id, &self.config.worker_id);
        }

        self.set_state(WorkerState::Executing);
        let heartbeat = self.start_heartbeat(task.id);
        let result = self.execute(&task).await;
        if heartbeat.stop().await {
            warn!("claim was lost during execution");
        }

        self.set_state(WorkerState::Reporting);
        let outcome = self.report(&task, result).await;
        self.set_state(WorkerState::Idle);
        outcome
    }

    /// Run the executor on its own task so a panic becomes a retryable error
    async fn execute(&self, task: &Task) -> ExecutionResult {
        let executor = Arc::clone(&self.executor);
        let owned = task.clone();
        match tokio::spawn(async move { executor.execute(&owned).await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!(panic = %message, "executor panicked");
                Err(ExecutionError::retryable(format!(
                    "executor panicked: {message}"
                )))
            }
            Err(e) => Err(ExecutionError::retryable(format!(
                "executor task aborted: {e}"
            ))),
        }
    }

    fn start_heartbeat(&self, task_id: TaskId) -> HeartbeatTicker {
        let store = Arc::clone(&self.store);
        let worker_id = self.config.worker_id.clone();
        let interval = self.config.heartbeat_interval;
        let counters = Arc::clone(&self.counters);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            // The claim itself set heartbeat_at, so the first beat waits a
            // full interval.
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => return false,
                    _ = ticker.tick() => {
                        match store.heartbeat(task_id, &worker_id).await {
                            Ok(true) => {
                                counters.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
                                trace!(%task_id, "heartbeat sent");
                            }
                            Ok(false) => {
                                warn!(%task_id, "heartbeat rejected, claim no longer held");
                                return true;
                            }
                            Err(e) => {
                                warn!(%task_id, error = %e, "heartbeat failed");
                            }
                        }
                    }
                }
            }
        });

        HeartbeatTicker { cancel, handle }
    }

    async fn report(&self, task: &Task, result: ExecutionResult) -> Result<TaskOutcome, WorkerError> {
        let worker_id = self.config.worker_id.as_str();
        let mut retries = 0;

        loop {
            let reported = match &result {
                Ok(value) => self
                    .store
                    .complete(task.id, worker_id, value.clone())
                    .await
                    .map(|completion| self.on_completion(task, completion, value, retries > 0)),
                Err(error) => self
                    .store
                    .fail(task.id, worker_id, error)
                    .await
                    .map(|outcome| self.on_failure(outcome, error)),
            };

            match reported {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_unavailable() && retries < self.config.report_retries => {
                    retries += 1;
                    warn!(retries, error = %e, "store unavailable while reporting, retrying");
                    tokio::time::sleep(self.config.report_retry_delay).await;
                }
                Err(e) if e.is_unavailable() => {
                    self.counters.unreported.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "could not report result, leaving task for the reaper");
                    return Ok(TaskOutcome::Unreported);
                }
                Err(e) => {
                    error!(error = %e, "failed to report result");
                    return Err(e.into());
                }
            }
        }
    }

    fn on_completion(
        &self,
        task: &Task,
        completion: Completion,
        result: &serde_json::Value,
        retried: bool,
    ) -> TaskOutcome {
        match completion {
            // After a retry, an earlier attempt committed without an acknowledgement
            Completion::AlreadyCompleted if retried => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                if let Some(reporter) = &self.reporter {
                    reporter.task_completed(task.id, &self.config.worker_id, result);
                }
                info!("task completed (acknowledged on retry)");
                TaskOutcome::Completed
            }
            Completion::Completed => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                if let Some(reporter) = &self.reporter {
                    reporter.task_completed(task.id, &self.config.worker_id, result);
                }
                info!("task completed");
                TaskOutcome::Completed
            }
            Completion::AlreadyCompleted => {
                debug!("task was already completed by this worker");
                TaskOutcome::Completed
            }
            Completion::OwnershipLost => {
                self.counters.ownership_lost.fetch_add(1, Ordering::Relaxed);
                warn!("result discarded, claim no longer held");
                TaskOutcome::OwnershipLost
            }
        }
    }

    fn on_failure(&self, outcome: FailureOutcome, error: &ExecutionError) -> TaskOutcome {
        match outcome {
            FailureOutcome::Requeued { attempts, retry_at } => {
                self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                info!(attempts, %retry_at, error = %error, "task failed, will retry");
                TaskOutcome::Requeued
            }
            FailureOutcome::Failed { attempts } => {
                self.counters.terminated.fetch_add(1, Ordering::Relaxed);
                warn!(attempts, fatal = error.is_fatal(), error = %error, "task failed terminally");
                TaskOutcome::Terminated
            }
            FailureOutcome::OwnershipLost => {
                self.counters.ownership_lost.fetch_add(1, Ordering::Relaxed);
                warn!(error = %error, "failure discarded, claim no longer held");
                TaskOutcome::OwnershipLost
            }
        }
    }
}

struct HeartbeatTicker {
    cancel: CancellationToken,
    handle: JoinHandle<bool>,
}

impl HeartbeatTicker {
    /// Stop ticking; `true` if the ticker saw the claim lost
    async fn stop(self) -> bool {
        self.cancel.cancel();
        self.handle.await.unwrap_or(false)
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryTaskStore;
    use crate::task::{NewTask, TaskStatus};
    use crate::worker::executor_fn;
    use serde_json::json;
    use std::time::Duration;

    struct Panics;

    #[async_trait::async_trait]
    impl Executor for Panics {
        async fn execute(&self, _task: &Task) -> ExecutionResult {
            panic!("kaboom")
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig::new()
            .with_worker_id("w1")
            .with_heartbeat_interval(Duration::from_millis(20))
            .with_reap_timeout(Duration::from_secs(1))
    }

    #[test]
    fn test_rejects_invalid_config() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let executor = executor_fn(|t| async move { Ok(t.payload) });
        let config = config().with_heartbeat_interval(Duration::from_secs(1));
        assert!(matches!(
            Worker::new(store, "echo", executor, config),
            Err(WorkerError::Config(ConfigError::HeartbeatTooSlow { .. }))
        ));
    }

    #[tokio::test]
    async fn test_run_once_completes() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let id = store
            .enqueue(NewTask::new("echo", json!({"x": 1})))
            .await
            .unwrap();
        let worker = Worker::new(
            store.clone(),
            "echo",
            executor_fn(|t| async move { Ok(t.payload) }),
            config(),
        )
        .unwrap();

        assert_eq!(worker.run_once().await.unwrap(), Some(TaskOutcome::Completed));
        assert_eq!(worker.run_once().await.unwrap(), None);
        assert_eq!(worker.state(), WorkerState::Idle);

        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(json!({"x": 1})));
        assert_eq!(worker.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_panic_is_retryable() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let id = store.enqueue(NewTask::new("boom", json!({}))).await.unwrap();
        let worker = Worker::new(
            store.clone(),
            "boom",
            Arc::new(Panics),
            config(),
        )
        .unwrap();

        assert_eq!(worker.run_once().await.unwrap(), Some(TaskOutcome::Requeued));
        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.error.unwrap().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_heartbeats_sent_during_long_execution() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        store.enqueue(NewTask::new("slow", json!({}))).await.unwrap();
        let worker = Worker::new(
            store,
            "slow",
            executor_fn(|_| async move {
                tokio::time::sleep(Duration::from_millis(120)).await;
                Ok(json!("done"))
            }),
            config(),
        )
        .unwrap();

        worker.run_once().await.unwrap();
        assert!(worker.stats().heartbeats_sent >= 2);
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42)), "unknown panic");
    }
}
