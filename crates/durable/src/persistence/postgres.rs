//! PostgreSQL implementation of TaskStore
//!
//! Multi-host persistence using PostgreSQL with:
//! - Claiming via `FOR UPDATE SKIP LOCKED`, so concurrent claimers never
//!   queue behind each other's row locks
//! - Guarded conditional updates for every holder operation
//! - A partial unique index that makes dedup keys race-free

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, error, info, instrument, warn};

use super::store::*;
use crate::clock::{system_clock, SharedClock};
use crate::reliability::Backoff;
use crate::strategy::{Candidate, CandidateFilter};
use crate::task::{ExecutionError, NewTask, Task, TaskId, TaskStatus};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS claimq_tasks (
        id              BIGSERIAL PRIMARY KEY,
        task_type       TEXT        NOT NULL,
        payload         JSONB       NOT NULL,
        status          TEXT        NOT NULL DEFAULT 'pending'
                        CHECK (status IN ('pending', 'claimed', 'completed', 'failed')),
        priority        INTEGER     NOT NULL DEFAULT 0,
        dedup_key       TEXT,
        attempts        INTEGER     NOT NULL DEFAULT 0,
        max_attempts    INTEGER     NOT NULL DEFAULT 3,
        claimed_by      TEXT,
        claimed_at      TIMESTAMPTZ,
        heartbeat_at    TIMESTAMPTZ,
        available_at    TIMESTAMPTZ NOT NULL,
        result          JSONB,
        error           TEXT,
        created_at      TIMESTAMPTZ NOT NULL,
        updated_at      TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_claimq_tasks_claimable
        ON claimq_tasks (task_type, available_at)
        WHERE status = 'pending'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_claimq_tasks_priority
        ON claimq_tasks (priority DESC, created_at)
        WHERE status = 'pending'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_claimq_tasks_heartbeat
        ON claimq_tasks (heartbeat_at)
        WHERE status = 'claimed'
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_claimq_tasks_dedup
        ON claimq_tasks (dedup_key)
        WHERE dedup_key IS NOT NULL AND status IN ('pending', 'claimed')
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS claimq_settings (
        key             TEXT        PRIMARY KEY,
        value           JSONB       NOT NULL,
        updated_at      TIMESTAMPTZ NOT NULL
    )
    "#,
];

const TASK_COLUMNS: &str = "id, task_type, payload, status, priority, dedup_key, attempts, \
     max_attempts, claimed_by, claimed_at, heartbeat_at, available_at, result, error, \
     created_at, updated_at";

/// PostgreSQL implementation of TaskStore
///
/// Uses a connection pool for efficient database access.
///
/// # Example
///
/// ```ignore
/// use claimq_durable::PostgresTaskStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresTaskStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
    clock: SharedClock,
    retry: Backoff,
}

impl PostgresTaskStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            clock: system_clock(),
            retry: Backoff::retry(),
        }
    }

    /// Connect to `url` and apply the schema
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(db_error("connect"))?;

        let store = Self::new(pool);
        store.migrate().await?;
        info!("postgres task store connected");
        Ok(store)
    }

    /// Create tables and indexes if they do not exist
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_error("migrate"))?;
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
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn claim_head(
        &self,
        filter: &CandidateFilter,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        // SKIP LOCKED: a row another claimer is updating is passed over
        // instead of waited on.
        let sql = format!(
            r#"
            WITH claimable AS (
                SELECT id AS task_id
                FROM claimq_tasks
                WHERE status = 'pending'
                  AND available_at <= $2
                  AND (cardinality($3::text[]) = 0 OR task_type = ANY($3))
                ORDER BY {order}
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE claimq_tasks
            SET status = 'claimed',
                claimed_by = $1,
                claimed_at = $2,
                heartbeat_at = $2,
                attempts = attempts + 1,
                updated_at = $2
            FROM claimable
            WHERE claimq_tasks.id = claimable.task_id
              AND claimq_tasks.status = 'pending'
            RETURNING {TASK_COLUMNS}
            "#,
            order = filter.strategy.order_by_sql(),
        );

        let row = sqlx::query(&sql)
            .bind(worker_id)
            .bind(now)
            .bind(&filter.task_types)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("claim task"))?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn candidates(
        &self,
        filter: &CandidateFilter,
        now: DateTime<Utc>,
    ) -> Result<Vec<Candidate>, StoreError> {
        let sql = format!(
            r#"
            SELECT id, priority, created_at
            FROM claimq_tasks
            WHERE status = 'pending'
              AND available_at <= $1
              AND (cardinality($2::text[]) = 0 OR task_type = ANY($2))
            ORDER BY {order}
            LIMIT $3
            "#,
            order = filter.strategy.order_by_sql(),
        );

        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(&filter.task_types)
            .bind(filter.strategy.window() as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("read claim candidates"))?;

        rows.iter()
            .map(|row| -> Result<Candidate, StoreError> {
                Ok(Candidate {
                    id: TaskId(row.try_get("id")?),
                    priority: row.try_get("priority")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn claim_by_id(
        &self,
        task_id: TaskId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let sql = format!(
            r#"
            UPDATE claimq_tasks
            SET status = 'claimed',
                claimed_by = $1,
                claimed_at = $2,
                heartbeat_at = $2,
                attempts = attempts + 1,
                updated_at = $2
            WHERE id = $3
              AND status = 'pending'
              AND available_at <= $2
            RETURNING {TASK_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(worker_id)
            .bind(now)
            .bind(task_id.as_i64())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("claim sampled task"))?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn holder(&self, task_id: TaskId) -> Result<(TaskStatus, Option<String>), StoreError> {
        let row = sqlx::query("SELECT status, claimed_by FROM claimq_tasks WHERE id = $1")
            .bind(task_id.as_i64())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("load task holder"))?
            .ok_or(StoreError::TaskNotFound(task_id))?;

        let status: String = row.try_get("status")?;
        Ok((parse_status(&status)?, row.try_get("claimed_by")?))
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, task), fields(task_type = %task.task_type))]
    async fn enqueue(&self, task: NewTask) -> Result<TaskId, StoreError> {
        task.validate().map_err(StoreError::Validation)?;

        // The dedup holder can finish between a conflicting insert and the
        // lookup; go around again in that case.
        for _ in 0..3 {
            let now = self.clock.now();
            let inserted: Option<i64> = sqlx::query_scalar(
                r#"
                INSERT INTO claimq_tasks
                    (task_type, payload, status, priority, dedup_key, attempts, max_attempts,
                     available_at, created_at, updated_at)
                VALUES ($1, $2, 'pending', $3, $4, 0, $5, $6, $6, $6)
                ON CONFLICT DO NOTHING
                RETURNING id
                "#,
            )
            .bind(&task.task_type)
            .bind(&task.payload)
            .bind(task.priority)
            .bind(&task.dedup_key)
            .bind(count_to_db(task.max_attempts, "max_attempts")?)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("enqueue task"))?;

            if let Some(id) = inserted {
                debug!(task_id = id, "enqueued task");
                return Ok(TaskId(id));
            }

            let existing: Option<i64> = sqlx::query_scalar(
                r#"
                SELECT id FROM claimq_tasks
                WHERE dedup_key = $1 AND status IN ('pending', 'claimed')
                "#,
            )
            .bind(&task.dedup_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("look up dedup key"))?;

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
        let now = self.clock.now();

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

    #[instrument(skip(self))]
    async fn heartbeat(&self, task_id: TaskId, worker_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE claimq_tasks
            SET heartbeat_at = $1, updated_at = $1
            WHERE id = $2 AND status = 'claimed' AND claimed_by = $3
            "#,
        )
        .bind(self.clock.now())
        .bind(task_id.as_i64())
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_error("heartbeat task"))?;

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
        let updated = sqlx::query(
            r#"
            UPDATE claimq_tasks
            SET status = 'completed',
                result = $1,
                heartbeat_at = NULL,
                updated_at = $2
            WHERE id = $3 AND status = 'claimed' AND claimed_by = $4
            "#,
        )
        .bind(&result)
        .bind(self.clock.now())
        .bind(task_id.as_i64())
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_error("complete task"))?;

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
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
            "#,
        )
        .bind(task_id.as_i64())
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("load failed task"))?;

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
                    error = $1,
                    heartbeat_at = NULL,
                    updated_at = $2
                WHERE id = $3 AND status = 'claimed' AND claimed_by = $4 AND attempts = $5
                "#,
            )
            .bind(error.message())
            .bind(now)
            .bind(task_id.as_i64())
            .bind(worker_id)
            .bind(count_to_db(attempts, "attempts")?)
            .execute(&self.pool)
            .await
            .map_err(db_error("fail task"))?;

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
                available_at = $1,
                error = $2,
                updated_at = $3
            WHERE id = $4 AND status = 'claimed' AND claimed_by = $5 AND attempts = $6
            "#,
        )
        .bind(retry_at)
        .bind(error.message())
        .bind(now)
        .bind(task_id.as_i64())
        .bind(worker_id)
        .bind(count_to_db(attempts, "attempts")?)
        .execute(&self.pool)
        .await
        .map_err(db_error("requeue task"))?;

        if updated.rows_affected() == 0 {
            return Ok(FailureOutcome::OwnershipLost);
        }
        debug!(attempts, %retry_at, "task will retry");
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
                error = $1::text || COALESCE(claimed_by, $2::text),
                heartbeat_at = NULL,
                available_at = $3,
                updated_at = $3
            WHERE status = 'claimed'
              AND (heartbeat_at IS NULL OR heartbeat_at < $4)
            RETURNING id, status
            "#,
        )
        .bind(STALE_ERROR_PREFIX)
        .bind(UNKNOWN_WORKER)
        .bind(now)
        .bind(threshold)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("reap stale tasks"))?;

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

    #[instrument(skip(self))]
    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM claimq_tasks WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(task_id.as_i64())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get task"))?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM claimq_tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("count tasks"))?;

        let mut stats = QueueStats::default();
        for row in &rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("n")?;
            stats.add(parse_status(&status)?, count as u64);
        }
        Ok(stats)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let value: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT value FROM claimq_settings WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error("read setting"))?;
        Ok(value)
    }

    async fn put_setting(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO claimq_settings (key, value, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(key)
        .bind(&value)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await
        .map_err(db_error("write setting"))?;
        Ok(())
    }
}

/// Log a failed query and classify the error
fn db_error(context: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| {
        error!("Failed to {}: {}", context, e);
        StoreError::from(e)
    }
}

fn parse_status(status: &str) -> Result<TaskStatus, StoreError> {
    status.parse().map_err(StoreError::Serialization)
}

/// Counters are INTEGER columns; anything past `i32::MAX` is refused, not wrapped
fn count_to_db(value: u32, column: &str) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| {
        StoreError::Validation(format!("{column} {value} exceeds the limit of {}", i32::MAX))
    })
}

fn count_from_row(row: &PgRow, column: &str) -> Result<u32, StoreError> {
    let value: i32 = row.try_get(column)?;
    u32::try_from(value).map_err(|_| StoreError::Integrity(format!("{column} is negative: {value}")))
}

fn task_from_row(row: &PgRow) -> Result<Task, StoreError> {
    let status: String = row.try_get("status")?;

    Ok(Task {
        id: TaskId(row.try_get("id")?),
        task_type: row.try_get("task_type")?,
        payload: row.try_get("payload")?,
        status: parse_status(&status)?,
        priority: row.try_get("priority")?,
        dedup_key: row.try_get("dedup_key")?,
        attempts: count_from_row(row, "attempts")?,
        max_attempts: count_from_row(row, "max_attempts")?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: row.try_get("claimed_at")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
        available_at: row.try_get("available_at")?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
