//! Persistence layer for the task queue
//!
//! This module provides:
//! - [`TaskStore`] trait with guarded, atomic state transitions
//! - [`InMemoryTaskStore`] for tests and single-process use
//! - [`SqliteTaskStore`] for single-host deployments (WAL mode)
//! - [`PostgresTaskStore`] for multi-host deployments (SKIP LOCKED claims)

mod memory;
mod postgres;
mod sqlite;
mod store;

use std::sync::Arc;

pub use memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;
pub use sqlite::SqliteTaskStore;
pub use store::{
    Completion, FailureOutcome, QueueStats, ReapOutcome, StoreError, TaskStore,
};

use crate::clock::SharedClock;

/// Open a store from a database URL
///
/// - `memory:` keeps everything in process
/// - `sqlite:<path>` / `sqlite://<path>` / `sqlite::memory:`
/// - `postgres://...` / `postgresql://...`
///
/// The schema is applied on open.
pub async fn connect(url: &str, clock: SharedClock) -> Result<Arc<dyn TaskStore>, StoreError> {
    if url == "memory:" || url == "memory" {
        return Ok(Arc::new(InMemoryTaskStore::new().with_clock(clock)));
    }
    if url.starts_with("sqlite:") {
        let store = SqliteTaskStore::connect(url).await?;
        return Ok(Arc::new(store.with_clock(clock)));
    }
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let store = PostgresTaskStore::connect(url).await?;
        return Ok(Arc::new(store.with_clock(clock)));
    }
    Err(StoreError::Validation(format!(
        "unsupported database url '{url}' (expected memory:, sqlite: or postgres://)"
    )))
}
