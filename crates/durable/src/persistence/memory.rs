//! In-memory implementation of TaskStore
//!
//! All state lives behind one mutex, so every operation is trivially atomic.
//! Provides the same semantics as the SQL stores and runs the same
//! conformance tests.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::store::*;
use crate::clock::{system_clock, SharedClock};
use crate::reliability::Backoff;
use crate::strategy::{Candidate, CandidateFilter};
use crate::task::{ExecutionError, NewTask, Task, TaskId, TaskStatus};

#[derive(Default)]
struct State {
    tasks: BTreeMap<TaskId, Task>,
    /// dedup_key -> id of the non-terminal task holding it
    active_dedup: HashMap<String, TaskId>,
    settings: HashMap<String, serde_json::Value>,
    next_id: i64,
}

impl State {
    fn release_dedup(&mut self, task_id: TaskId) {
        let key = self.tasks.get(&task_id).and_then(|t| t.dedup_key.clone());
        if let Some(key) = key {
            if self.active_dedup.get(&key) == Some(&task_id) {
                self.active_dedup.remove(&key);
            }
        }
    }
}

/// In-memory implementation of TaskStore
///
/// # Example
///
/// ```
/// use claimq_durable::InMemoryTaskStore;
///
/// let store = InMemoryTaskStore::new();
/// assert_eq!(store.task_count(), 0);
/// ```
pub struct InMemoryTaskStore {
    state: Mutex<State>,
    clock: SharedClock,
    retry: Backoff,
}

impl InMemoryTaskStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 1,
                ..Default::default()
            }),
            clock: system_clock(),
            retry: Backoff::retry(),
        }
    }

    /// Use a different time source
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Use a different delay policy for retried tasks
    pub fn with_retry_backoff(mut self, retry: Backoff) -> Self {
        self.retry = retry;
        self
    }

    /// Get the number of stored tasks
    pub fn task_count(&self) -> usize {
        self.state.lock().tasks.len()
    }

    fn claim_locked(
        state: &mut State,
        task_id: TaskId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError> {
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if task.status != TaskStatus::Pending {
            return Err(StoreError::Integrity(format!(
                "task {task_id} selected for claim while {}",
                task.status
            )));
        }

        task.status = TaskStatus::Claimed;
        task.claimed_by = Some(worker_id.to_string());
        task.claimed_at = Some(now);
        task.heartbeat_at = Some(now);
        task.attempts += 1;
        task.updated_at = now;
        Ok(task.clone())
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn enqueue(&self, task: NewTask) -> Result<TaskId, StoreError> {
        task.validate().map_err(StoreError::Validation)?;

        let now = self.clock.now();
        let mut state = self.state.lock();

        if let Some(key) = &task.dedup_key {
            if let Some(existing) = state.active_dedup.get(key) {
                return Ok(*existing);
            }
        }

        let task_id = TaskId(state.next_id);
        state.next_id += 1;

        if let Some(key) = &task.dedup_key {
            state.active_dedup.insert(key.clone(), task_id);
        }

        state.tasks.insert(
            task_id,
            Task {
                id: task_id,
                task_type: task.task_type,
                payload: task.payload,
                status: TaskStatus::Pending,
                priority: task.priority,
                dedup_key: task.dedup_key,
                attempts: 0,
                max_attempts: task.max_attempts,
                claimed_by: None,
                claimed_at: None,
                heartbeat_at: None,
                available_at: now,
                result: None,
                error: None,
                created_at: now,
                updated_at: now,
            },
        );

        Ok(task_id)
    }

    async fn try_claim(
        &self,
        filter: &CandidateFilter,
        worker_id: &str,
    ) -> Result<Option<Task>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let mut candidates: Vec<Candidate> = state
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && t.available_at <= now
                    && filter.matches_type(&t.task_type)
            })
            .map(|t| Candidate {
                id: t.id,
                priority: t.priority,
                created_at: t.created_at,
            })
            .collect();

        if candidates.is_empty() {
            return Ok(None);
        }

        let strategy = &filter.strategy;
        candidates.sort_by(|a, b| strategy.compare(a, b));
        candidates.truncate(strategy.window());

        let Some(index) = strategy.pick(&candidates, &mut rand::thread_rng()) else {
            return Ok(None);
        };

        let task = Self::claim_locked(&mut state, candidates[index].id, worker_id, now)?;
        Ok(Some(task))
    }

    async fn heartbeat(&self, task_id: TaskId, worker_id: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        match state.tasks.get_mut(&task_id) {
            Some(task) if task.is_claimed_by(worker_id) => {
                task.heartbeat_at = Some(now);
                task.updated_at = now;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::TaskNotFound(task_id)),
        }
    }

    async fn complete(
        &self,
        task_id: TaskId,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<Completion, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if task.is_claimed_by(worker_id) {
            task.status = TaskStatus::Completed;
            task.result = Some(result);
            task.heartbeat_at = None;
            task.updated_at = now;
            state.release_dedup(task_id);
            return Ok(Completion::Completed);
        }

        if task.status == TaskStatus::Completed && task.claimed_by.as_deref() == Some(worker_id) {
            return Ok(Completion::AlreadyCompleted);
        }

        Ok(Completion::OwnershipLost)
    }

    async fn fail(
        &self,
        task_id: TaskId,
        worker_id: &str,
        error: &ExecutionError,
    ) -> Result<FailureOutcome, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if !task.is_claimed_by(worker_id) {
            return Ok(FailureOutcome::OwnershipLost);
        }

        task.error = Some(error.message().to_string());
        task.heartbeat_at = None;
        task.updated_at = now;

        if error.is_fatal() || !task.has_attempts_remaining() {
            task.status = TaskStatus::Failed;
            let attempts = task.attempts;
            state.release_dedup(task_id);
            return Ok(FailureOutcome::Failed { attempts });
        }

        let delay = chrono::Duration::from_std(self.retry.delay(task.attempts))
            .unwrap_or(chrono::Duration::zero());
        let retry_at = now + delay;
        task.status = TaskStatus::Pending;
        task.claimed_by = None;
        task.available_at = retry_at;

        Ok(FailureOutcome::Requeued {
            attempts: task.attempts,
            retry_at,
        })
    }

    async fn reap_stale(&self, timeout: Duration) -> Result<ReapOutcome, StoreError> {
        let now = self.clock.now();
        let threshold = now - chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero());
        let mut state = self.state.lock();

        let stale: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Claimed
                    && t.heartbeat_at.map(|hb| hb < threshold).unwrap_or(true)
            })
            .map(|t| t.id)
            .collect();

        let mut outcome = ReapOutcome::default();
        for task_id in stale {
            let Some(task) = state.tasks.get_mut(&task_id) else {
                continue;
            };
            task.error = Some(stale_error(task.claimed_by.as_deref()));
            task.heartbeat_at = None;
            task.updated_at = now;

            if task.has_attempts_remaining() {
                task.status = TaskStatus::Pending;
                task.claimed_by = None;
                task.available_at = now;
                outcome.requeued.push(task_id);
            } else {
                task.status = TaskStatus::Failed;
                state.release_dedup(task_id);
                outcome.failed.push(task_id);
            }
        }

        Ok(outcome)
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.state.lock().tasks.get(&task_id).cloned())
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let state = self.state.lock();
        let mut stats = QueueStats::default();
        for task in state.tasks.values() {
            stats.add(task.status, 1);
        }
        Ok(stats)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self.state.lock().settings.get(key).cloned())
    }

    async fn put_setting(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        self.state.lock().settings.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::ClaimStrategy;
    use serde_json::json;

    #[tokio::test]
    async fn test_enqueue_assigns_increasing_ids() {
        let store = InMemoryTaskStore::new();
        let a = store.enqueue(NewTask::new("echo", json!({}))).await.unwrap();
        let b = store.enqueue(NewTask::new("echo", json!({}))).await.unwrap();
        assert!(b > a);
        assert_eq!(store.task_count(), 2);
    }

    #[tokio::test]
    async fn test_claim_filters_by_type() {
        let store = InMemoryTaskStore::new();
        store.enqueue(NewTask::new("echo", json!({}))).await.unwrap();

        let filter = CandidateFilter::for_type("sleep", ClaimStrategy::Fifo);
        assert!(store.try_claim(&filter, "w1").await.unwrap().is_none());

        let filter = CandidateFilter::for_type("echo", ClaimStrategy::Fifo);
        let task = store.try_claim(&filter, "w1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Claimed);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.claimed_by.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_dedup_key_released_on_completion() {
        let store = InMemoryTaskStore::new();
        let first = store
            .enqueue(NewTask::new("echo", json!({})).with_dedup_key("k"))
            .await
            .unwrap();

        let filter = CandidateFilter::new(ClaimStrategy::Fifo);
        let task = store.try_claim(&filter, "w1").await.unwrap().unwrap();
        store.complete(task.id, "w1", json!({})).await.unwrap();

        let second = store
            .enqueue(NewTask::new("echo", json!({})).with_dedup_key("k"))
            .await
            .unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_missing_task_errors() {
        let store = InMemoryTaskStore::new();
        assert!(matches!(
            store.heartbeat(TaskId(99), "w1").await,
            Err(StoreError::TaskNotFound(TaskId(99)))
        ));
        assert!(store.get(TaskId(99)).await.unwrap().is_none());
    }
}
