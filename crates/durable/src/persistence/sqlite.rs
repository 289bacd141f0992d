//! SQLite implementation of TaskStore
//!
//! Single-host persistence. The database runs in WAL mode so readers never
//! block the writer, and every state transition is one `UPDATE` statement
//! guarded by the expected status; SQLite serializes writers, so a claim can
//! only ever succeed once. Timestamps are stored as integer milliseconds.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, instrument, warn};

use super::store::*;
use crate::clock::{system_clock, SharedClock};
use crate::reliability::Backoff;
use crate::strategy::{Candidate, CandidateFilter};
use crate::task::{ExecutionError, NewTask, Task, TaskId, TaskStatus};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS claimq_tasks (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        task_type       TEXT    NOT NULL,
        payload         TEXT    NOT NULL,
        status          TEXT    NOT NULL DEFAULT 'pending',
        priority        INTEGER NOT NULL DEFAULT 0,
        dedup_key       TEXT,
        attempts        INTEGER NOT NULL DEFAULT 0,
        max_attempts    INTEGER NOT NULL DEFAULT 3,
        claimed_by      TEXT,
        claimed_at      INTEGER,
        heartbeat_at    INTEGER,
        available_at    INTEGER NOT NULL,
        result          TEXT,
        error           TEXT,
        created_at      INTEGER NOT NULL,
        updated_at      INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_claimq_tasks_claimable
        ON claimq_tasks (status, task_type, available_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_claimq_tasks_priority
        ON claimq_tasks (status, priority DESC, created_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_claimq_tasks_heartbeat
        ON claimq_tasks (status, heartbeat_at)
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_claimq_tasks_dedup
        ON claimq_tasks (dedup_key)
        WHERE dedup_key IS NOT NULL AND status IN ('pending', 'claimed')
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS claimq_settings (
        key             TEXT    PRIMARY KEY,
        value           TEXT    NOT NULL,
        updated_at      INTEGER NOT NULL
    )
    "#,
];

const TASK_COLUMNS: &str = "id, task_type, payload, status, priority, dedup_key, attempts, \
     max_attempts, claimed_by, claimed_at, heartbeat_at, available_at, result, error, \
     created_at, updated_at";

/// SQLite implementation of TaskStore
///
/// # Example
///
/// ```ignore
/// use claimq_durable::SqliteTaskStore;
///
/// let store = SqliteTaskStore::open("claimq.db").await?;
/// ```
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
    clock: SharedClock,
    retry: Backoff,
}

impl SqliteTaskStore {
    /// Open (creating if missing) a database file and apply the schema
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let store = Self::connect_with(options, 8).await?;
        info!(path = %path.display(), "sqlite task store opened");
        Ok(store)
    }

    /// Connect using a `sqlite:` URL
    ///
    /// `sqlite::memory:` gets a single connection, since every connection to
    /// an in-memory database sees its own empty database.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let max_connections = if url.contains(":memory:") { 1 } else { 8 };
        let store = Self::connect_with(options, max_connections).await?;
        info!(url, "sqlite task store opened");
        Ok(store)
    }

    async fn connect_with(
        options: SqliteConnectOptions,
        max_connections: u32,
    ) -> Result<Self, StoreError> {
        let options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            clock: system_clock(),
            retry: Backoff::retry(),
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Create tables and indexes if they do not exist
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_backoff(mut self, retry: Backoff) -> Self {
        self.retry = retry;
        self
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn now_millis(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    /// JSON array of allowed types, or NULL for "any type"
    fn type_filter(filter: &CandidateFilter) -> Result<Option<String>, StoreError> {
        if filter.task_types.is_empty() {
            Ok(None)
        } else {
            Ok(Some(serde_json::to_string(&filter.task_types)?))
        }
    }

    async fn claim_head(
        &self,
        filter: &CandidateFilter,
        worker_id: &str,
        now: i64,
    ) -> Result<Option<Task>, StoreError> {
        let sql = format!(
            r#"
            UPDATE claimq_tasks
            SET status = 'claimed',
                claimed_by = ?1,
                claimed_at = ?2,
                heartbeat_at = ?2,
                attempts = attempts + 1,
                updated_at = ?2
            WHERE id = (
                SELECT id FROM claimq_tasks
                WHERE status = 'pending'
                  AND available_at <= ?2
                  AND (?3 IS NULL OR task_type IN (SELECT value FROM json_each(?3)))
                ORDER BY {order}
                LIMIT 1
            )
              AND status = 'pending'
            RETURNING {TASK_COLUMNS}
            "#,
            order = filter.strategy.order_by_sql(),
        );

        let row = sqlx::query(&sql)
            .bind(worker_id)
            .bind(now)
            .bind(Self::type_filter(filter)?)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn candidates(
        &self,
        filter: &CandidateFilter,
        now: i64,
    ) -> Result<Vec<Candidate>, StoreError> {
        let sql = format!(
            r#"
            SELECT id, priority, created_at FROM claimq_tasks
            WHERE status = 'pending'
              AND available_at <= ?1
              AND (?2 IS NULL OR task_type IN (SELECT value FROM json_each(?2)))
            ORDER BY {order}
            LIMIT ?3
            "#,
            order = filter.strategy.order_by_sql(),
        );

        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(Self::type_filter(filter)?)
            .bind(filter.strategy.window() as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<Candidate, StoreError> {
                Ok(Candidate {
                    id: TaskId(row.try_get("id")?),
                    priority: row.try_get::<i64, _>("priority")? as i32,
                    created_at: from_millis(row.try_get("created_at")?)?,
                })
            })
            .collect()
    }

    async fn claim_by_id(
        &self,
        task_id: TaskId,
        worker_id: &str,
        now: i64,
    ) -> Result<Option<Task>, StoreError> {
        let sql = format!(
            r#"
            UPDATE claimq_tasks
            SET status = 'claimed',
                claimed_by = ?1,
                claimed_at = ?2,
                heartbeat_at = ?2,
                attempts = attempts + 1,
                updated_at = ?2
            WHERE id = ?3
              AND status = 'pending'
              AND available_at <= ?2
            RETURNING {TASK_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(worker_id)
            .bind(now)
            .bind(task_id.as_i64())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn holder(&self, task_id: TaskId) -> Result<(TaskStatus, Option<String>), StoreError> {
        let row = sqlx::query("SELECT status, claimed_by FROM claimq_tasks WHERE id = ?1")
            .bind(task_id.as_i64())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::TaskNotFound(task_id))?;

        let status: String = row.try_get("status")?;
        Ok((parse_status(&status)?, row.try_get("claimed_by")?))
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    #[instrument(skip(self, task), fields(task_type = %task.task_type))]
    async fn enqueue(&self, task: NewTask) -> Result<TaskId, StoreError> {
        task.validate().map_err(StoreError::Validation)?;
        let payload = serde_json::to_string(&task.payload)?;

        // The dedup holder can finish between a conflicting insert and the
        // lookup; go around again in that case.
        for _ in 0..3 {
            let now = self.now_millis();
            let inserted: Option<i64> = sqlx::query_scalar(
                r#"
                INSERT INTO claimq_tasks
                    (task_type, payload, status, priority, dedup_key, attempts, max_attempts,
                     available_at, created_at, updated_at)
                VALUES (?1, ?2, 'pending', ?3, ?4, 0, ?5, ?6, ?6, ?6)
                ON CONFLICT DO NOTHING
                RETURNING id
                "#,
            )
            .bind(&task.task_type)
            .bind(&payload)
            .bind(task.priority)
            .bind(&task.dedup_key)
            .bind(i64::from(task.max_attempts))
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(id) = inserted {
                debug!(task_id = id, "enqueued task");
                return Ok(TaskId(id));
            }

            let existing: Option<i64> = sqlx::query_scalar(
                r#"
                SELECT id FROM claimq_tasks
                WHERE dedup_key = ?1 AND status IN ('pending', 'claimed')
                "#,
            )
            .bind(&task.dedup_key)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(id) = existing {
                debug!(task_id = id, dedup_key = ?task.dedup_key, "deduplicated enqueue");
                return Ok(TaskId(id));
            }
        }

        Err(StoreError::Integrity(format!(
            "enqueue of dedup key {:?} kept conflicting",
            task.dedup_key
        )))
    }

    #[instrument(skip(self, filter), fields(strategy = %filter.strategy))]
    async fn try_claim(
        &self,
        filter: &CandidateFilter,
        worker_id: &str,
    ) -> Result<Option<Task>, StoreError> {
        let now = self.now_millis();

        if filter.strategy.is_sampling() {
            for _ in 0..SAMPLED_CLAIM_ATTEMPTS {
                let candidates = self.candidates(filter, now).await?;
                let Some(index) = filter.strategy.pick(&candidates, &mut rand::thread_rng())
                else {
                    return Ok(None);
                };
                if let Some(task) = self.claim_by_id(candidates[index].id, worker_id, now).await? {
                    debug!(task_id = %task.id, "claimed task");
                    return Ok(Some(task));
                }
            }
            warn!("sampled claims kept losing races, taking the head of the window");
        }

        let claimed = self.claim_head(filter, worker_id, now).await?;
        if let Some(task) = &claimed {
            debug!(task_id = %task.id, "claimed task");
        }
        Ok(claimed)
    }

    async fn heartbeat(&self, task_id: TaskId, worker_id: &str) -> Result<bool, StoreError> {
        let now = self.now_millis();
        let result = sqlx::query(
            r#"
            UPDATE claimq_tasks
            SET heartbeat_at = ?1, updated_at = ?1
            WHERE id = ?2 AND status = 'claimed' AND claimed_by = ?3
            "#,
        )
        .bind(now)
        .bind(task_id.as_i64())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.holder(task_id).await?;
        Ok(false)
    }

    #[instrument(skip(self, result))]
    async fn complete(
        &self,
        task_id: TaskId,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<Completion, StoreError> {
        let now = self.now_millis();
        let updated = sqlx::query(
            r#"
            UPDATE claimq_tasks
            SET status = 'completed',
                result = ?1,
                heartbeat_at = NULL,
                updated_at = ?2
            WHERE id = ?3 AND status = 'claimed' AND claimed_by = ?4
            "#,
        )
        .bind(serde_json::to_string(&result)?)
        .bind(now)
        .bind(task_id.as_i64())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 1 {
            debug!("completed task");
            return Ok(Completion::Completed);
        }

        match self.holder(task_id).await? {
            (TaskStatus::Completed, Some(holder)) if holder == worker_id => {
                Ok(Completion::AlreadyCompleted)
            }
            _ => Ok(Completion::OwnershipLost),
        }
    }

    #[instrument(skip(self, error))]
    async fn fail(
        &self,
        task_id: TaskId,
        worker_id: &str,
        error: &ExecutionError,
    ) -> Result<FailureOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT attempts, max_attempts FROM claimq_tasks
            WHERE id = ?1 AND status = 'claimed' AND claimed_by = ?2
            "#,
        )
        .bind(task_id.as_i64())
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            self.holder(task_id).await?;
            return Ok(FailureOutcome::OwnershipLost);
        };

        let attempts = count_from_row(&row, "attempts")?;
        let max_attempts = count_from_row(&row, "max_attempts")?;
        let now = self.clock.now();

        if error.is_fatal() || attempts >= max_attempts {
            let updated = sqlx::query(
                r#"
                UPDATE claimq_tasks
                SET status = 'failed',
                    error = ?1,
                    heartbeat_at = NULL,
                    updated_at = ?2
                WHERE id = ?3 AND status = 'claimed' AND claimed_by = ?4 AND attempts = ?5
                "#,
            )
            .bind(error.message())
            .bind(now.timestamp_millis())
            .bind(task_id.as_i64())
            .bind(worker_id)
            .bind(i64::from(attempts))
            .execute(&self.pool)
            .await?;

            if updated.rows_affected() == 0 {
                return Ok(FailureOutcome::OwnershipLost);
            }
            debug!(attempts, fatal = error.is_fatal(), "task failed");
            return Ok(FailureOutcome::Failed { attempts });
        }

        let retry_at =
            now + chrono::Duration::from_std(self.retry.delay(attempts)).unwrap_or_default();
        let updated = sqlx::query(
            r#"
            UPDATE claimq_tasks
            SET status = 'pending',
                claimed_by = NULL,
                heartbeat_at = NULL,
                available_at = ?1,
                error = ?2,
                updated_at = ?3
            WHERE id = ?4 AND status = 'claimed' AND claimed_by = ?5 AND attempts = ?6
            "#,
        )
        .bind(retry_at.timestamp_millis())
        .bind(error.message())
        .bind(now.timestamp_millis())
        .bind(task_id.as_i64())
        .bind(worker_id)
        .bind(i64::from(attempts))
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Ok(FailureOutcome::OwnershipLost);
        }
        debug!(attempts, %retry_at, "task requeued");
        Ok(FailureOutcome::Requeued { attempts, retry_at })
    }

    #[instrument(skip(self))]
    async fn reap_stale(&self, timeout: Duration) -> Result<ReapOutcome, StoreError> {
        let now = self.clock.now();
        let threshold = now - chrono::Duration::from_std(timeout).unwrap_or_default();

        let rows = sqlx::query(
            r#"
            UPDATE claimq_tasks
            SET status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'pending' END,
                claimed_by = CASE WHEN attempts >= max_attempts THEN claimed_by ELSE NULL END,
                error = ?1 || COALESCE(claimed_by, ?2),
                heartbeat_at = NULL,
                available_at = ?3,
                updated_at = ?3
            WHERE status = 'claimed'
              AND (heartbeat_at IS NULL OR heartbeat_at < ?4)
            RETURNING id, status
            "#,
        )
        .bind(STALE_ERROR_PREFIX)
        .bind(UNKNOWN_WORKER)
        .bind(now.timestamp_millis())
        .bind(threshold.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        let mut outcome = ReapOutcome::default();
        for row in &rows {
            let id = TaskId(row.try_get("id")?);
            let status: String = row.try_get("status")?;
            match parse_status(&status)? {
                TaskStatus::Failed => outcome.failed.push(id),
                _ => outcome.requeued.push(id),
            }
        }
        outcome.requeued.sort();
        outcome.failed.sort();

        if !outcome.is_empty() {
            debug!(
                requeued = outcome.requeued.len(),
                failed = outcome.failed.len(),
                "reaped stale tasks"
            );
        }
        Ok(outcome)
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM claimq_tasks WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(task_id.as_i64())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM claimq_tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = QueueStats::default();
        for row in &rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("n")?;
            stats.add(parse_status(&status)?, count as u64);
        }
        Ok(stats)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM claimq_settings WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        value
            .map(|v| serde_json::from_str(&v).map_err(StoreError::from))
            .transpose()
    }

    async fn put_setting(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO claimq_settings (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(serde_json::to_string(&value)?)
        .bind(self.now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Serialization(format!("timestamp out of range: {millis}")))
}

fn opt_millis(millis: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    millis.map(from_millis).transpose()
}

fn parse_status(status: &str) -> Result<TaskStatus, StoreError> {
    status.parse().map_err(StoreError::Serialization)
}

fn count_from_row(row: &SqliteRow, column: &str) -> Result<u32, StoreError> {
    let value: i64 = row.try_get(column)?;
    u32::try_from(value).map_err(|_| StoreError::Integrity(format!("{column} out of range: {value}")))
}

fn task_from_row(row: &SqliteRow) -> Result<Task, StoreError> {
    let payload: String = row.try_get("payload")?;
    let result: Option<String> = row.try_get("result")?;
    let status: String = row.try_get("status")?;

    Ok(Task {
        id: TaskId(row.try_get("id")?),
        task_type: row.try_get("task_type")?,
        payload: serde_json::from_str(&payload)?,
        status: parse_status(&status)?,
        priority: row.try_get::<i64, _>("priority")? as i32,
        dedup_key: row.try_get("dedup_key")?,
        attempts: count_from_row(row, "attempts")?,
        max_attempts: count_from_row(row, "max_attempts")?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: opt_millis(row.try_get("claimed_at")?)?,
        heartbeat_at: opt_millis(row.try_get("heartbeat_at")?)?,
        available_at: from_millis(row.try_get("available_at")?)?,
        result: result.map(|r| serde_json::from_str(&r)).transpose()?,
        error: row.try_get("error")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}
