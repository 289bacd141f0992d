//! Workers that claim and execute tasks
//!
//! This module provides:
//! - [`Worker`] - Claims tasks of one type and drives them to a terminal state
//! - [`TaskPoller`] - Claim polling with exponential backoff
//! - [`ExecutorRegistry`] - Task type to [`Executor`] mapping
//! - [`WorkerFactory`] - Builds workers from a registry
//! - [`Reaper`] - Returns stale claims to the queue
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         Worker                            │
//! │  ┌─────────────┐   ┌──────────────┐   ┌───────────────┐  │
//! │  │ TaskPoller  │──▶│   Executor   │──▶│ complete/fail │  │
//! │  │  (backoff)  │   │  (spawned)   │   │  (+ retries)  │  │
//! │  └─────────────┘   └──────┬───────┘   └───────────────┘  │
//! │                           │                               │
//! │                    ┌──────▼───────┐                       │
//! │                    │  Heartbeat   │                       │
//! │                    │   ticker     │                       │
//! │                    └──────────────┘                       │
//! └──────────────────────────────────────────────────────────┘
//!
//! ┌──────────────────────────────────────────────────────────┐
//! │  Reaper: stale claims → pending (or failed when exhausted)│
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use claimq_durable::worker::{ExecutorRegistry, WorkerConfig, WorkerFactory};
//!
//! let mut registry = ExecutorRegistry::new();
//! registry.register_fn("echo", |task| async move { Ok(task.payload) })?;
//!
//! let factory = WorkerFactory::new(store, registry);
//! let worker = factory.build("echo", WorkerConfig::from_env()?)?;
//! worker.run(shutdown).await?;
//! ```

mod config;
mod executor;
mod factory;
mod poller;
mod reaper;
#[allow(clippy::module_inception)]
mod worker;

pub use config::WorkerConfig;
pub use executor::{
    executor_fn, ExecutionResult, Executor, ExecutorRegistry, FnExecutor, RegistrationError,
};
pub use factory::{FactoryError, WorkerFactory};
pub use poller::{PollerConfig, PollerError, PollerStats, TaskPoller};
pub use reaper::{Reaper, ReaperConfig, ReaperStats};
pub use worker::{TaskOutcome, Worker, WorkerError, WorkerState, WorkerStats};
