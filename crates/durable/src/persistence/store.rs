//! TaskStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::strategy::CandidateFilter;
use crate::task::{ExecutionError, NewTask, Task, TaskId, TaskStatus};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Enqueue request rejected before reaching storage
    #[error("validation error: {0}")]
    Validation(String),

    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// The store cannot be reached (connection refused, pool exhausted or closed)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A guarded update observed a state the guards should make impossible
    #[error("integrity violation: {0}")]
    Integrity(String),
}

impl StoreError {
    /// Whether retrying later might succeed
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            sqlx::Error::Database(ref db) if is_busy(db.as_ref()) => {
                StoreError::Unavailable(err.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Serialization(err.to_string())
            }
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// SQLite lock contention that outlived the busy timeout
fn is_busy(err: &dyn sqlx::error::DatabaseError) -> bool {
    use sqlx::error::DatabaseError as _;

    err.try_downcast_ref::<sqlx::sqlite::SqliteError>()
        .and_then(|e| e.code())
        .is_some_and(|code| is_busy_code(&code))
}

/// SQLITE_BUSY (5) / SQLITE_LOCKED (6), including extended codes such as
/// SQLITE_BUSY_SNAPSHOT (517), whose low byte is the primary code
fn is_busy_code(code: &str) -> bool {
    code.parse::<i32>()
        .is_ok_and(|code| matches!(code & 0xff, 5 | 6))
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Result of [`TaskStore::complete`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    /// This call moved the task to `completed`
    Completed,
    /// The same worker already completed the task; nothing changed
    AlreadyCompleted,
    /// The caller no longer holds the claim (reaped or claimed elsewhere)
    OwnershipLost,
}

/// Result of [`TaskStore::fail`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailureOutcome {
    /// Back to `pending`, claimable from `retry_at`
    Requeued {
        attempts: u32,
        retry_at: DateTime<Utc>,
    },
    /// Terminal `failed` (attempts exhausted or fatal error)
    Failed { attempts: u32 },
    /// The caller no longer holds the claim; nothing changed
    OwnershipLost,
}

/// Result of [`TaskStore::reap_stale`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapOutcome {
    /// Stale tasks returned to `pending`
    pub requeued: Vec<TaskId>,
    /// Stale tasks that had no attempts left and were failed instead
    pub failed: Vec<TaskId>,
}

impl ReapOutcome {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.requeued.len() + self.failed.len()
    }
}

/// Task counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.claimed + self.completed + self.failed
    }

    /// Add `count` to the bucket for `status`
    pub fn add(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::Claimed => self.claimed += count,
            TaskStatus::Completed => self.completed += count,
            TaskStatus::Failed => self.failed += count,
        }
    }
}

/// Durable task queue
///
/// Every state transition is a single conditional update guarded by the
/// expected status (and, for holder operations, `claimed_by`), so two workers
/// can never both observe success for the same claim. Implementations must be
/// thread-safe and support concurrent access from many workers.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    // =========================================================================
    // Producer Operations
    // =========================================================================

    /// Insert a pending task
    ///
    /// When `dedup_key` matches a pending or claimed task, returns that task's
    /// id and inserts nothing.
    async fn enqueue(&self, task: NewTask) -> Result<TaskId, StoreError>;

    // =========================================================================
    // Worker Operations
    // =========================================================================

    /// Atomically claim one eligible task, or `None` when nothing is eligible
    async fn try_claim(
        &self,
        filter: &CandidateFilter,
        worker_id: &str,
    ) -> Result<Option<Task>, StoreError>;

    /// Refresh `heartbeat_at`; `false` when `worker_id` no longer holds the task
    async fn heartbeat(&self, task_id: TaskId, worker_id: &str) -> Result<bool, StoreError>;

    /// Mark a claimed task completed
    async fn complete(
        &self,
        task_id: TaskId,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<Completion, StoreError>;

    /// Record a failed attempt; requeues or fails terminally
    async fn fail(
        &self,
        task_id: TaskId,
        worker_id: &str,
        error: &ExecutionError,
    ) -> Result<FailureOutcome, StoreError>;

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Requeue claimed tasks whose heartbeat is older than `timeout`
    async fn reap_stale(&self, timeout: Duration) -> Result<ReapOutcome, StoreError>;

    // =========================================================================
    // Inspection and Settings
    // =========================================================================

    /// Load a task by id
    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Count tasks per status
    async fn stats(&self) -> Result<QueueStats, StoreError>;

    /// Read a value from the settings table
    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

    /// Write a value to the settings table
    async fn put_setting(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError>;
}

/// Guarded updates a sampled claim attempts before falling back to the head of the window
pub(crate) const SAMPLED_CLAIM_ATTEMPTS: usize = 3;

/// Prefix of the error the reaper writes on a task taken from a silent worker
pub(crate) const STALE_ERROR_PREFIX: &str = "heartbeat expired while claimed by ";

/// Stand-in holder name when a claimed row has no `claimed_by`
pub(crate) const UNKNOWN_WORKER: &str = "unknown worker";

pub(crate) fn stale_error(worker_id: Option<&str>) -> String {
    format!("{STALE_ERROR_PREFIX}{}", worker_id.unwrap_or(UNKNOWN_WORKER))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_classification() {
        let err: StoreError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_unavailable());

        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(!err.is_unavailable());
        assert!(matches!(err, StoreError::Database(_)));
    }

    #[test]
    fn test_busy_codes_include_extended_codes() {
        // primary codes
        assert!(is_busy_code("5"));
        assert!(is_busy_code("6"));
        // SQLITE_BUSY_SNAPSHOT, SQLITE_BUSY_RECOVERY, SQLITE_LOCKED_SHAREDCACHE
        assert!(is_busy_code("517"));
        assert!(is_busy_code("261"));
        assert!(is_busy_code("262"));

        assert!(!is_busy_code("1"));
        // SQLITE_CONSTRAINT_UNIQUE
        assert!(!is_busy_code("2067"));
        assert!(!is_busy_code("abc"));
    }

    #[test]
    fn test_queue_stats() {
        let mut stats = QueueStats::default();
        stats.add(TaskStatus::Pending, 3);
        stats.add(TaskStatus::Failed, 1);
        stats.add(TaskStatus::Pending, 2);
        assert_eq!(stats.pending, 5);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total(), 6);
    }

    #[test]
    fn test_reap_outcome() {
        let outcome = ReapOutcome {
            requeued: vec![TaskId(1), TaskId(2)],
            failed: vec![TaskId(3)],
        };
        assert_eq!(outcome.total(), 3);
        assert!(!outcome.is_empty());
        assert!(ReapOutcome::default().is_empty());
    }

    #[test]
    fn test_stale_error() {
        assert_eq!(
            stale_error(Some("w1")),
            "heartbeat expired while claimed by w1"
        );
        assert!(stale_error(None).ends_with("unknown worker"));
    }

    #[test]
    fn test_failure_outcome_serialization() {
        let json = serde_json::to_value(FailureOutcome::Failed { attempts: 3 }).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["attempts"], 3);
    }
}
