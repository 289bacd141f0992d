//! TaskStore decorator that mirrors newly enqueued tasks to the registry
//!
//! Workers report claims and completions themselves; task creation happens
//! wherever `enqueue` is called, so producers wrap their store in
//! [`MirroredTaskStore`]. A deduplicated enqueue reports the existing task
//! again under the same id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::reporter::RemoteReporter;
use crate::persistence::{
    Completion, FailureOutcome, QueueStats, ReapOutcome, StoreError, TaskStore,
};
use crate::strategy::CandidateFilter;
use crate::task::{ExecutionError, NewTask, Task, TaskId};

pub struct MirroredTaskStore {
    inner: Arc<dyn TaskStore>,
    reporter: RemoteReporter,
}

impl MirroredTaskStore {
    pub fn new(inner: Arc<dyn TaskStore>, reporter: RemoteReporter) -> Self {
        Self { inner, reporter }
    }

    pub fn reporter(&self) -> &RemoteReporter {
        &self.reporter
    }
}

#[async_trait]
impl TaskStore for MirroredTaskStore {
    async fn enqueue(&self, task: NewTask) -> Result<TaskId, StoreError> {
        let task_id = self.inner.enqueue(task).await?;

        // The local enqueue already succeeded; a failed read only skips the mirror.
        match self.inner.get(task_id).await {
            Ok(Some(task)) => self.reporter.task_created(&task),
            Ok(None) => debug!(%task_id, "enqueued task vanished before mirroring"),
            Err(e) => debug!(%task_id, error = %e, "could not load enqueued task for mirroring"),
        }
        Ok(task_id)
    }

    async fn try_claim(
        &self,
        filter: &CandidateFilter,
        worker_id: &str,
    ) -> Result<Option<Task>, StoreError> {
        self.inner.try_claim(filter, worker_id).await
    }

    async fn heartbeat(&self, task_id: TaskId, worker_id: &str) -> Result<bool, StoreError> {
        self.inner.heartbeat(task_id, worker_id).await
    }

    async fn complete(
        &self,
        task_id: TaskId,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<Completion, StoreError> {
        self.inner.complete(task_id, worker_id, result).await
    }

    async fn fail(
        &self,
        task_id: TaskId,
        worker_id: &str,
        error: &ExecutionError,
    ) -> Result<FailureOutcome, StoreError> {
        self.inner.fail(task_id, worker_id, error).await
    }

    async fn reap_stale(&self, timeout: Duration) -> Result<ReapOutcome, StoreError> {
        self.inner.reap_stale(timeout).await
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        self.inner.get(task_id).await
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        self.inner.stats().await
    }

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        self.inner.get_setting(key).await
    }

    async fn put_setting(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        self.inner.put_setting(key, value).await
    }
}
