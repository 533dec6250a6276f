use serde_json::Value;
use sqlx::SqlitePool;
use std::fmt::Display;
use std::time::Duration;
use uuid::Uuid;

use crate::db::queries;
use crate::models::job::{now_secs, Job, JobStats, JobStatus, JobUpdate, ReclaimOutcome, StalePolicy};

/// SQLite primary result codes that mean another connection holds the lock.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Durable job queue backed by the SQLite job store.
///
/// This is the only interface the web process and the workers use to touch job
/// state. It is cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct JobQueue {
    pool: SqlitePool,
}

impl JobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Enqueue a job and return its freshly generated id.
    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: &Value,
        requested_by: Option<&str>,
        max_attempts: i64,
    ) -> Result<Uuid, QueueError> {
        let id = queries::insert_job(
            &self.pool,
            job_type,
            payload,
            requested_by,
            max_attempts,
            now_secs(),
        )
        .await?;

        tracing::debug!(job_id = %id, job_type = %job_type, "Job enqueued");
        Ok(id)
    }

    /// Look up a job; `None` when no job has this id.
    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, QueueError> {
        queries::get_job(&self.pool, job_id).await
    }

    /// Newest jobs first, filtered by status and type when given.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        job_type: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Job>, QueueError> {
        queries::list_jobs(&self.pool, status, job_type, limit).await
    }

    /// Atomically take ownership of the oldest queued job.
    pub async fn claim_next_job(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        queries::claim_next_job(&self.pool, worker_id, now_secs()).await
    }

    /// Partial update; `updated_at` is always refreshed and `finished_at` is set
    /// on terminal statuses. Returns false if the job does not exist.
    pub async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        update: JobUpdate,
    ) -> Result<bool, QueueError> {
        queries::update_job_status(&self.pool, job_id, status, &update, now_secs()).await
    }

    /// Replace the progress document of a running job.
    pub async fn update_job_progress(&self, job_id: Uuid, progress: &Value) -> Result<bool, QueueError> {
        queries::update_job_progress(&self.pool, job_id, progress, now_secs()).await
    }

    /// Recover jobs left in `running` for longer than `timeout` by a crashed worker.
    pub async fn requeue_stale_jobs(
        &self,
        timeout: Duration,
        policy: StalePolicy,
    ) -> Result<ReclaimOutcome, QueueError> {
        let now = now_secs();
        let cutoff = now - timeout.as_secs_f64();
        let outcome = queries::requeue_stale_jobs(&self.pool, cutoff, policy, now).await?;

        if outcome.requeued > 0 || outcome.failed > 0 {
            tracing::warn!(
                requeued = outcome.requeued,
                failed = outcome.failed,
                policy = %policy,
                timeout_secs = timeout.as_secs(),
                "Reclaimed stale jobs"
            );
        }
        Ok(outcome)
    }

    /// Exact per-status job counts.
    pub async fn job_stats(&self) -> Result<JobStats, QueueError> {
        queries::count_jobs_by_status(&self.pool).await
    }

    /// Check store connectivity (for health checks).
    pub async fn ping(&self) -> Result<(), QueueError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job store busy: {0}")]
    Busy(#[source] sqlx::Error),

    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Corrupt job record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl QueueError {
    pub(crate) fn corrupt(id: &str, reason: impl Display) -> Self {
        QueueError::Corrupt {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Lock contention clears up on its own; callers should back off and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Busy(_))
    }
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        if is_busy(&err) {
            QueueError::Busy(err)
        } else {
            QueueError::Database(err)
        }
    }
}

fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_err) => db_err
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
            .unwrap_or(false),
        _ => false,
    }
}
