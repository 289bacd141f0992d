//! Task model shared by every store, the worker and the CLI

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default ceiling on claims before a task fails terminally
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Largest accepted payload, measured as serialized JSON
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Largest `max_attempts` every backend can store (an INTEGER column)
pub const MAX_ATTEMPTS_LIMIT: u32 = i32::MAX as u32;

/// Longest accepted task type name
pub const MAX_TASK_TYPE_LEN: usize = 128;

/// Unique, monotonically assigned task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl TaskId {
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl From<i64> for TaskId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(TaskId)
    }
}

/// Task lifecycle state
///
/// ```text
/// pending ──claim──▶ claimed ──complete──▶ completed
///    ▲                  │
///    └──fail / reap─────┤
///                       └──fail (exhausted or fatal)──▶ failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed
    Pending,
    /// Held by exactly one worker
    Claimed,
    /// Finished successfully
    Completed,
    /// Failed terminally (attempts exhausted or fatal error)
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal states never transition again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A task row as stored in the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub priority: i32,
    pub dedup_key: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Earliest time the task may be claimed (pushed out by retry backoff)
    pub available_at: DateTime<Utc>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Whether another failure would still be retried
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Whether `worker_id` currently holds the claim
    pub fn is_claimed_by(&self, worker_id: &str) -> bool {
        self.status == TaskStatus::Claimed && self.claimed_by.as_deref() == Some(worker_id)
    }
}

/// Enqueue request
///
/// # Example
///
/// ```
/// use claimq_durable::NewTask;
/// use serde_json::json;
///
/// let task = NewTask::new("render_thumbnail", json!({"video": 42}))
///     .with_priority(5)
///     .with_dedup_key("thumb-42")
///     .with_max_attempts(4);
/// assert!(task.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub task_type: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub dedup_key: Option<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            priority: 0,
            dedup_key: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Check the request before it reaches a store
    pub fn validate(&self) -> Result<(), String> {
        validate_task_type(&self.task_type)?;

        if !(self.payload.is_object() || self.payload.is_array()) {
            return Err("payload must be a JSON object or array".to_string());
        }
        let size = serde_json::to_vec(&self.payload)
            .map_err(|e| format!("payload is not serializable: {e}"))?
            .len();
        if size > MAX_PAYLOAD_BYTES {
            return Err(format!(
                "payload is {size} bytes, limit is {MAX_PAYLOAD_BYTES}"
            ));
        }

        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(format!(
                "max_attempts {} exceeds the limit of {MAX_ATTEMPTS_LIMIT}",
                self.max_attempts
            ));
        }
        if let Some(key) = &self.dedup_key {
            if key.trim().is_empty() {
                return Err("dedup_key must not be empty".to_string());
            }
        }
        Ok(())
    }
}

/// Task type names: `[A-Za-z0-9_.:-]`, 1..=128 chars
pub fn validate_task_type(task_type: &str) -> Result<(), String> {
    if task_type.is_empty() {
        return Err("task type must not be empty".to_string());
    }
    if task_type.len() > MAX_TASK_TYPE_LEN {
        return Err(format!(
            "task type is longer than {MAX_TASK_TYPE_LEN} characters"
        ));
    }
    if let Some(c) = task_type
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-')))
    {
        return Err(format!("task type contains invalid character {c:?}"));
    }
    Ok(())
}

/// Error returned by an executor
///
/// Routing is a pure function of the variant: `Retryable` requeues while
/// attempts remain, `Fatal` goes straight to `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum ExecutionError {
    /// Transient failure (network, rate limit, timeout)
    #[error("{0}")]
    Retryable(String),

    /// Input that will never succeed
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ExecutionError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(m) | Self::Fatal(m) => m,
        }
    }
}
