//! # Claim Queue
//!
//! A durable task queue with atomic, race-free claiming for distributed workers.
//!
//! ## Features
//!
//! - **Exactly one winner per claim**: every transition is a guarded conditional update
//! - **Claim strategies**: FIFO, LIFO, priority, and priority-weighted random sampling
//! - **Crash recovery**: heartbeats keep claims alive; the reaper requeues stale ones
//! - **Bounded retries**: retryable failures requeue with backoff until `max_attempts`
//! - **Deduplication**: one active task per `dedup_key`
//! - **Pluggable storage**: in-memory, SQLite (single host), PostgreSQL (many hosts)
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  enqueue   ┌─────────────────────────────────┐
//! │   Producer   │──────────▶│            TaskStore             │
//! └──────────────┘            │  (memory / SQLite / PostgreSQL) │
//!                             └─────────────────────────────────┘
//!                               ▲ try_claim      ▲ reap_stale
//!                               │ heartbeat      │
//!                               │ complete/fail  │
//!                      ┌────────┴───────┐  ┌─────┴──────┐
//!                      │ Worker (×N)    │  │  Reaper    │
//!                      └────────────────┘  └────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use claimq_durable::prelude::*;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
//! store.enqueue(NewTask::new("echo", json!({"hello": "world"}))).await.unwrap();
//!
//! let worker = Worker::new(
//!     store.clone(),
//!     "echo",
//!     executor_fn(|task| async move { Ok(task.payload) }),
//!     WorkerConfig::new().with_worker_id("worker-1"),
//! )
//! .unwrap();
//!
//! assert_eq!(worker.run_once().await.unwrap(), Some(TaskOutcome::Completed));
//! assert_eq!(store.stats().await.unwrap().completed, 1);
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod persistence;
pub mod reliability;
pub mod remote;
pub mod strategy;
pub mod task;
pub mod worker;

mod util;

/// Prelude for common imports
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SharedClock, SystemClock};
    pub use crate::config::{ConfigError, QueueSettings};
    pub use crate::persistence::{
        Completion, FailureOutcome, InMemoryTaskStore, PostgresTaskStore, QueueStats,
        ReapOutcome, SqliteTaskStore, StoreError, TaskStore,
    };
    pub use crate::reliability::Backoff;
    pub use crate::strategy::{CandidateFilter, ClaimStrategy, WeightedRandom};
    pub use crate::task::{ExecutionError, NewTask, Task, TaskId, TaskStatus};
    pub use crate::worker::{
        executor_fn, Executor, ExecutorRegistry, Reaper, ReaperConfig, TaskOutcome, Worker,
        WorkerConfig, WorkerError, WorkerFactory,
    };
    pub use tokio_util::sync::CancellationToken;
}

// Re-export key types at crate root
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ConfigError, QueueSettings};
pub use persistence::{
    Completion, FailureOutcome, InMemoryTaskStore, PostgresTaskStore, QueueStats, ReapOutcome,
    SqliteTaskStore, StoreError, TaskStore,
};
pub use reliability::Backoff;
pub use strategy::{CandidateFilter, ClaimStrategy, WeightedRandom};
pub use task::{ExecutionError, NewTask, Task, TaskId, TaskStatus};
pub use worker::{
    executor_fn, Executor, ExecutorRegistry, Reaper, ReaperConfig, TaskOutcome, Worker,
    WorkerConfig, WorkerError, WorkerFactory,
};
