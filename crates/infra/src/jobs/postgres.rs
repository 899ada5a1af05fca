//! Postgres-backed job store.
//!
//! ## Claiming
//!
//! `claim_next` is a single `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP
//! LOCKED) RETURNING ...`. Concurrent claimers skip rows another transaction
//! has locked instead of waiting on them, so two workers can never receive the
//! same job and a slow claimer never blocks the others.
//!
//! ## Reports
//!
//! Completion, failure, cancel and retry lock the row (`SELECT ... FOR UPDATE`),
//! apply the transition in Rust with the same rules the in-memory store uses,
//! and write the row back in the same transaction.
//!
//! ## Error Mapping
//!
//! Every SQLx error maps to `QueueError::StoreUnavailable`, except check
//! constraint violations (`23514`), which map to `QueueError::Validation`.
//!
//! ## Time
//!
//! `now` is always bound from the injected [`Clock`], never taken from
//! `NOW()`, so the database and in-memory stores agree in tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};

use jobforge_core::{Clock, JobId, QueueError, QueueResult, SystemClock, WorkerId};

use super::store::{start_of_day, stale_report, JobStore, ReportKind, LEASE_EXPIRED_ERROR};
use super::types::{
    ClaimFilter, FailureKind, Job, JobAttemptRecord, JobListFilter, JobStatus, NewJob, QueueStats,
    ReportOutcome, RetryBackoff,
};

const SCHEMA: &str = include_str!("../../migrations/0001_jobs.sql");

const JOB_COLUMNS: &str = "id, job_type, payload, queue, priority, status, attempts, max_attempts, \
     available_at, claimed_by, result, error, history, created_at, updated_at, started_at, finished_at";

/// Postgres job store.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
    backoff: RetryBackoff,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            clock: Arc::new(SystemClock),
            backoff: RetryBackoff::default(),
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> QueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Create the `jobs` table and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> QueueResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        debug!("jobs schema applied");
        Ok(())
    }

    async fn begin(&self, operation: &str) -> QueueResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_type = %job.job_type, queue = %job.queue), err)]
    async fn insert(&self, job: NewJob) -> QueueResult<JobId> {
        let job = job.validate()?;
        let now = self.clock.now();

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (
                job_type, payload, queue, priority, status, attempts, max_attempts,
                available_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, 'pending', 0, $5, $6, $7, $7)
            RETURNING id
            "#,
        )
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(&job.queue)
        .bind(job.priority)
        .bind(job.max_attempts as i32)
        .bind(job.available_at.max(now))
        .bind(now)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        Ok(JobId::new(id))
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> QueueResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.as_i64())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(Job::try_from).transpose()
    }

    #[instrument(skip(self, filter), fields(worker = %worker, queue = ?filter.queue), err)]
    async fn claim_next(&self, filter: &ClaimFilter, worker: &WorkerId) -> QueueResult<Option<Job>> {
        let now = self.clock.now();

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET status = 'processing',
                attempts = attempts + 1,
                claimed_by = $1,
                started_at = $2,
                finished_at = NULL,
                updated_at = $2
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'pending'
                  AND available_at <= $2
                  AND ($3::text IS NULL OR queue = $3)
                  AND ($4::text[] IS NULL OR job_type = ANY($4))
                ORDER BY priority ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(worker.as_str())
        .bind(now)
        .bind(filter.queue.as_deref())
        .bind(filter.job_types.as_deref())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.map(Job::try_from).transpose()
    }

    #[instrument(skip(self, result), fields(job_id = %id, worker = %worker), err)]
    async fn complete(
        &self,
        id: JobId,
        worker: &WorkerId,
        result: serde_json::Value,
    ) -> QueueResult<ReportOutcome> {
        let now = self.clock.now();
        let mut tx = self.begin("complete").await?;
        let mut job = lock_job(&mut tx, id, "complete").await?;

        if !job.is_held_by(worker) {
            return stale_report(&job, ReportKind::Complete);
        }

        job.mark_completed(result, now);
        write_back(&mut tx, &job, "complete").await?;
        commit(tx, "complete").await?;
        Ok(ReportOutcome::Applied)
    }

    #[instrument(skip(self, error), fields(job_id = %id, worker = %worker, kind = ?kind), err)]
    async fn fail(
        &self,
        id: JobId,
        worker: &WorkerId,
        error: String,
        kind: FailureKind,
    ) -> QueueResult<ReportOutcome> {
        let now = self.clock.now();
        let mut tx = self.begin("fail").await?;
        let mut job = lock_job(&mut tx, id, "fail").await?;

        if !job.is_held_by(worker) {
            return stale_report(&job, ReportKind::Fail);
        }

        job.mark_failed(error, kind, &self.backoff, now);
        write_back(&mut tx, &job, "fail").await?;
        commit(tx, "fail").await?;
        Ok(ReportOutcome::Applied)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn cancel(&self, id: JobId) -> QueueResult<Job> {
        let now = self.clock.now();
        let mut tx = self.begin("cancel").await?;
        let mut job = lock_job(&mut tx, id, "cancel").await?;

        if !job.status.can_transition_to(JobStatus::Cancelled) {
            return Err(QueueError::invalid_state(id, job.status.as_str(), "cancel"));
        }

        job.mark_cancelled(now);
        write_back(&mut tx, &job, "cancel").await?;
        commit(tx, "cancel").await?;
        Ok(job)
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: &JobListFilter) -> QueueResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR queue = $2)
            ORDER BY id DESC
            LIMIT $3
            "#
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.queue.as_deref())
        .bind(filter.limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.into_iter().map(Job::try_from).collect()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn retry_failed(&self, id: JobId, extra_attempts: u32) -> QueueResult<Job> {
        let now = self.clock.now();
        let mut tx = self.begin("retry_failed").await?;
        let mut job = lock_job(&mut tx, id, "retry_failed").await?;

        if job.status != JobStatus::Failed {
            return Err(QueueError::invalid_state(id, job.status.as_str(), "retry"));
        }

        job.requeue(extra_attempts, now);
        write_back(&mut tx, &job, "retry_failed").await?;
        commit(tx, "retry_failed").await?;
        Ok(job)
    }

    #[instrument(skip(self), err)]
    async fn release_stale(&self, older_than: Duration) -> QueueResult<Vec<JobId>> {
        let now = self.clock.now();
        let cutoff = now - chrono::Duration::from_std(older_than).unwrap_or_default();
        let mut tx = self.begin("release_stale").await?;

        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status = 'processing' AND started_at <= $1
            ORDER BY id
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("release_stale", e))?;

        let mut released = Vec::with_capacity(rows.len());
        for row in rows {
            let mut job = Job::try_from(row)?;
            job.mark_failed(
                LEASE_EXPIRED_ERROR.to_string(),
                FailureKind::Retryable,
                &self.backoff,
                now,
            );
            write_back(&mut tx, &job, "release_stale").await?;
            released.push(job.id);
        }

        commit(tx, "release_stale").await?;
        Ok(released)
    }

    #[instrument(skip(self), err)]
    async fn stats(&self, queue: Option<&str>) -> QueueResult<QueueStats> {
        let now = self.clock.now();

        let row = sqlx::query_as::<_, StatsRow>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed' AND finished_at >= $2) AS completed_today,
                COUNT(*) FILTER (WHERE status = 'failed' AND finished_at >= $3) AS failed_last_24h,
                COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled,
                (AVG(EXTRACT(EPOCH FROM (finished_at - started_at)) * 1000)
                    FILTER (WHERE status = 'completed' AND finished_at >= $3))::float8 AS avg_duration_ms,
                (MAX(EXTRACT(EPOCH FROM (finished_at - started_at)) * 1000)
                    FILTER (WHERE status = 'completed' AND finished_at >= $3))::bigint AS max_duration_ms,
                COUNT(DISTINCT claimed_by) FILTER (WHERE status = 'processing') AS active_workers
            FROM jobs
            WHERE ($1::text IS NULL OR queue = $1)
            "#,
        )
        .bind(queue)
        .bind(start_of_day(now))
        .bind(now - chrono::Duration::hours(24))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        Ok(row.into())
    }
}

async fn lock_job(
    tx: &mut Transaction<'static, Postgres>,
    id: JobId,
    operation: &str,
) -> QueueResult<Job> {
    let row = sqlx::query_as::<_, JobRow>(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"
    ))
    .bind(id.as_i64())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;

    row.ok_or(QueueError::NotFound(id)).and_then(Job::try_from)
}

async fn write_back(
    tx: &mut Transaction<'static, Postgres>,
    job: &Job,
    operation: &str,
) -> QueueResult<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = $2,
            attempts = $3,
            max_attempts = $4,
            available_at = $5,
            claimed_by = $6,
            result = $7,
            error = $8,
            history = $9,
            updated_at = $10,
            started_at = $11,
            finished_at = $12
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_i64())
    .bind(job.status.as_str())
    .bind(job.attempts as i32)
    .bind(job.max_attempts as i32)
    .bind(job.available_at)
    .bind(job.claimed_by.as_ref().map(WorkerId::as_str))
    .bind(&job.result)
    .bind(&job.error)
    .bind(Json(&job.history))
    .bind(job.updated_at)
    .bind(job.started_at)
    .bind(job.finished_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;

    Ok(())
}

async fn commit(tx: Transaction<'static, Postgres>, operation: &str) -> QueueResult<()> {
    tx.commit().await.map_err(|e| map_sqlx_error(operation, e))
}

#[derive(Debug)]
struct JobRow {
    id: i64,
    job_type: String,
    payload: serde_json::Value,
    queue: String,
    priority: i32,
    status: String,
    attempts: i32,
    max_attempts: i32,
    available_at: DateTime<Utc>,
    claimed_by: Option<String>,
    result: Option<serde_json::Value>,
    error: Option<String>,
    history: Json<Vec<JobAttemptRecord>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            queue: row.try_get("queue")?,
            priority: row.try_get("priority")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            available_at: row.try_get("available_at")?,
            claimed_by: row.try_get("claimed_by")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            history: row.try_get("history")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| QueueError::store_unavailable(format!("job {}: {e}", row.id)))?;

        Ok(Self {
            id: JobId::new(row.id),
            job_type: row.job_type,
            payload: row.payload,
            queue: row.queue,
            priority: row.priority,
            status,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            available_at: row.available_at,
            claimed_by: row.claimed_by.map(WorkerId::from),
            result: row.result,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            history: row.history.0,
        })
    }
}

#[derive(Debug)]
struct StatsRow {
    pending: i64,
    processing: i64,
    completed_today: i64,
    failed_last_24h: i64,
    cancelled: i64,
    avg_duration_ms: Option<f64>,
    max_duration_ms: Option<i64>,
    active_workers: i64,
}

impl<'r> FromRow<'r, PgRow> for StatsRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            pending: row.try_get("pending")?,
            processing: row.try_get("processing")?,
            completed_today: row.try_get("completed_today")?,
            failed_last_24h: row.try_get("failed_last_24h")?,
            cancelled: row.try_get("cancelled")?,
            avg_duration_ms: row.try_get("avg_duration_ms")?,
            max_duration_ms: row.try_get("max_duration_ms")?,
            active_workers: row.try_get("active_workers")?,
        })
    }
}

impl From<StatsRow> for QueueStats {
    fn from(row: StatsRow) -> Self {
        Self {
            pending: row.pending as u64,
            processing: row.processing as u64,
            completed_today: row.completed_today as u64,
            failed_last_24h: row.failed_last_24h as u64,
            cancelled: row.cancelled as u64,
            avg_duration_ms: row.avg_duration_ms,
            max_duration_ms: row.max_duration_ms.map(|ms| ms.max(0) as u64),
            active_workers: row.active_workers as u64,
        }
    }
}

/// Map SQLx errors to QueueError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Check constraint violation
                Some("23514") => QueueError::Validation(msg),
                _ => QueueError::StoreUnavailable(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            QueueError::StoreUnavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            QueueError::StoreUnavailable(format!("connection pool timed out in {}", operation))
        }
        _ => QueueError::StoreUnavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}
