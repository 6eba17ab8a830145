//! Postgres-backed queue broker.
//!
//! Jobs live in a single `bulk_queue_jobs` table. Claims use
//! `FOR UPDATE SKIP LOCKED`, so any number of processes can run workers for
//! the same lane without handing one attempt to two workers. Every write on
//! behalf of an attempt is guarded by `state = 'active' AND attempts_made`,
//! and lease age is measured against the database clock.
//!
//! ## Error Mapping
//!
//! Every `sqlx::Error` becomes `QueueError::Storage` with the failing
//! operation in the message. A row whose `state` column holds an unknown
//! value is reported the same way. A guarded write that matches no row is
//! `QueueError::LeaseLost`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use bulkops_core::{JobId, OwnerId};

use super::broker::{QueueBroker, QueueError};
use super::types::QueuedJob;

const JOB_COLUMNS: &str = "id, lane, owner_id, payload, state, attempts_made, max_attempts, \
     progress, result, failed_reason, available_at, created_at, updated_at, finished_at";

/// Durable broker on top of a Postgres connection pool.
#[derive(Debug, Clone)]
pub struct PostgresQueueBroker {
    pool: Arc<PgPool>,
}

impl PostgresQueueBroker {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect to `database_url` with a small pool.
    pub async fn connect(database_url: &str) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the queue table and its claim index if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bulk_queue_jobs (
                id UUID PRIMARY KEY,
                lane TEXT NOT NULL,
                owner_id UUID NOT NULL,
                payload JSONB NOT NULL,
                state TEXT NOT NULL DEFAULT 'waiting',
                attempts_made INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                progress SMALLINT NOT NULL DEFAULT 0,
                result JSONB,
                failed_reason TEXT,
                available_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                finished_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS bulk_queue_jobs_claim_idx
                ON bulk_queue_jobs (lane, state, available_at, created_at)
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        Ok(())
    }

    /// Run a write guarded by the attempt's lease.
    async fn update_leased(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
        job_id: JobId,
    ) -> Result<(), QueueError> {
        let done = query
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        if done.rows_affected() == 0 {
            return Err(QueueError::LeaseLost(job_id));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueBroker for PostgresQueueBroker {
    #[instrument(skip(self, job), fields(job_id = %job.id, lane = %job.lane), err)]
    async fn enqueue(&self, job: QueuedJob) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO bulk_queue_jobs (
                id, lane, owner_id, payload, state, attempts_made, max_attempts,
                progress, result, failed_reason, available_at, created_at, updated_at, finished_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(Uuid::from(job.id))
        .bind(&job.lane)
        .bind(Uuid::from(job.owner))
        .bind(&job.payload)
        .bind(job.state.as_str())
        .bind(job.attempts_made as i32)
        .bind(job.max_attempts as i32)
        .bind(job.progress as i16)
        .bind(&job.result)
        .bind(&job.failed_reason)
        .bind(job.available_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.finished_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;
        Ok(())
    }

    async fn get(&self, lane: &str, job_id: JobId) -> Result<QueuedJob, QueueError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM bulk_queue_jobs WHERE id = $1 AND lane = $2"
        ))
        .bind(Uuid::from(job_id))
        .bind(lane)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?
        .ok_or(QueueError::NotFound(job_id))?;

        decode_job(&row)
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self, lane: &str) -> Result<Option<QueuedJob>, QueueError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE bulk_queue_jobs
            SET state = 'active', attempts_made = attempts_made + 1, progress = 0, updated_at = NOW()
            WHERE id = (
                SELECT id
                FROM bulk_queue_jobs
                WHERE lane = $1 AND state = 'waiting' AND available_at <= NOW()
                ORDER BY created_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(lane)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.as_ref().map(decode_job).transpose()
    }

    async fn heartbeat(&self, job_id: JobId, attempt: u32) -> Result<(), QueueError> {
        let query = sqlx::query(
            "UPDATE bulk_queue_jobs SET updated_at = NOW() \
             WHERE id = $1 AND state = 'active' AND attempts_made = $2",
        )
        .bind(Uuid::from(job_id))
        .bind(attempt as i32);
        self.update_leased("heartbeat", query, job_id).await
    }

    async fn report_progress(
        &self,
        job_id: JobId,
        attempt: u32,
        progress: u8,
    ) -> Result<(), QueueError> {
        let query = sqlx::query(
            "UPDATE bulk_queue_jobs SET progress = $3, updated_at = NOW() \
             WHERE id = $1 AND state = 'active' AND attempts_made = $2",
        )
        .bind(Uuid::from(job_id))
        .bind(attempt as i32)
        .bind(progress.min(100) as i16);
        self.update_leased("report_progress", query, job_id).await
    }

    #[instrument(skip(self, result), err)]
    async fn complete(&self, job_id: JobId, attempt: u32, result: Value) -> Result<(), QueueError> {
        let query = sqlx::query(
            r#"
            UPDATE bulk_queue_jobs
            SET state = 'completed', progress = 100, result = $3, failed_reason = NULL,
                finished_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND state = 'active' AND attempts_made = $2
            "#,
        )
        .bind(Uuid::from(job_id))
        .bind(attempt as i32)
        .bind(result);
        self.update_leased("complete", query, job_id).await
    }

    #[instrument(skip(self), err)]
    async fn fail_attempt(
        &self,
        job_id: JobId,
        attempt: u32,
        reason: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), QueueError> {
        let query = match retry_at {
            Some(at) => sqlx::query(
                r#"
                UPDATE bulk_queue_jobs
                SET state = 'waiting', failed_reason = $3, available_at = $4, updated_at = NOW()
                WHERE id = $1 AND state = 'active' AND attempts_made = $2
                "#,
            )
            .bind(Uuid::from(job_id))
            .bind(attempt as i32)
            .bind(reason)
            .bind(at),
            None => sqlx::query(
                r#"
                UPDATE bulk_queue_jobs
                SET state = 'failed', failed_reason = $3, finished_at = NOW(), updated_at = NOW()
                WHERE id = $1 AND state = 'active' AND attempts_made = $2
                "#,
            )
            .bind(Uuid::from(job_id))
            .bind(attempt as i32)
            .bind(reason),
        };
        self.update_leased("fail_attempt", query, job_id).await
    }

    #[instrument(skip(self), err)]
    async fn recover_stalled(
        &self,
        lane: &str,
        stall_timeout: Duration,
    ) -> Result<u64, QueueError> {
        let done = sqlx::query(
            r#"
            UPDATE bulk_queue_jobs
            SET state = 'waiting', updated_at = NOW()
            WHERE lane = $1 AND state = 'active'
              AND updated_at < NOW() - make_interval(secs => $2)
            "#,
        )
        .bind(lane)
        .bind(stall_timeout.as_secs_f64())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("recover_stalled", e))?;
        Ok(done.rows_affected())
    }

    async fn pending(&self, lane: &str) -> Result<u64, QueueError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM bulk_queue_jobs WHERE lane = $1 AND state = 'waiting'",
        )
        .bind(lane)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("pending", e))?;
        Ok(count.max(0) as u64)
    }
}

struct QueuedJobRow {
    id: Uuid,
    lane: String,
    owner_id: Uuid,
    payload: Value,
    state: String,
    attempts_made: i32,
    max_attempts: i32,
    progress: i16,
    result: Option<Value>,
    failed_reason: Option<String>,
    available_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for QueuedJobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(QueuedJobRow {
            id: row.try_get("id")?,
            lane: row.try_get("lane")?,
            owner_id: row.try_get("owner_id")?,
            payload: row.try_get("payload")?,
            state: row.try_get("state")?,
            attempts_made: row.try_get("attempts_made")?,
            max_attempts: row.try_get("max_attempts")?,
            progress: row.try_get("progress")?,
            result: row.try_get("result")?,
            failed_reason: row.try_get("failed_reason")?,
            available_at: row.try_get("available_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }
}

impl TryFrom<QueuedJobRow> for QueuedJob {
    type Error = QueueError;

    fn try_from(row: QueuedJobRow) -> Result<Self, Self::Error> {
        Ok(QueuedJob {
            id: JobId::from_uuid(row.id),
            lane: row.lane,
            owner: OwnerId::from_uuid(row.owner_id),
            payload: row.payload,
            state: row.state.parse()?,
            attempts_made: row.attempts_made.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            progress: row.progress.clamp(0, 100) as u8,
            result: row.result,
            failed_reason: row.failed_reason,
            available_at: row.available_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            finished_at: row.finished_at,
        })
    }
}

fn decode_job(row: &PgRow) -> Result<QueuedJob, QueueError> {
    let row = QueuedJobRow::from_row(row)
        .map_err(|e| QueueError::Storage(format!("failed to decode queue row: {e}")))?;
    QueuedJob::try_from(row)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            QueueError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            QueueError::Storage(format!("connection pool closed in {operation}"))
        }
        other => QueueError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
