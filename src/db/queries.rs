use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::job::{Job, JobStats, JobStatus, JobUpdate, ReclaimOutcome, StalePolicy};
use crate::services::queue::QueueError;

const JOB_COLUMNS: &str = "id, type, status, created_at, updated_at, started_at, finished_at, \
     requested_by, payload, result, error, attempts, max_attempts, progress, worker_id";

/// Error recorded on a job whose last allowed run was abandoned by its worker.
pub const ABANDONED_ERROR: &str = "Job abandoned by worker (stale timeout) and out of attempts";

/// Insert a new queued job and return its id
pub async fn insert_job(
    pool: &SqlitePool,
    job_type: &str,
    payload: &Value,
    requested_by: Option<&str>,
    max_attempts: i64,
    now: f64,
) -> Result<Uuid, QueueError> {
    let id = Uuid::new_v4();
    let payload = serde_json::to_string(payload)?;

    sqlx::query(
        r#"
        INSERT INTO jobs (id, type, status, created_at, updated_at, payload, requested_by, max_attempts)
        VALUES (?, ?, 'queued', ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(job_type)
    .bind(now)
    .bind(now)
    .bind(payload)
    .bind(requested_by)
    .bind(max_attempts)
    .execute(pool)
    .await?;

    Ok(id)
}

/// Get a job by ID
pub async fn get_job(pool: &SqlitePool, job_id: Uuid) -> Result<Option<Job>, QueueError> {
    fetch_job(pool, &job_id.to_string()).await
}

async fn fetch_job(pool: &SqlitePool, key: &str) -> Result<Option<Job>, QueueError> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
        .bind(key)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// List jobs newest first, optionally filtered by status and type
pub async fn list_jobs(
    pool: &SqlitePool,
    status: Option<JobStatus>,
    job_type: Option<&str>,
    limit: i64,
) -> Result<Vec<Job>, QueueError> {
    let mut query = QueryBuilder::<Sqlite>::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE 1 = 1"));

    if let Some(status) = status {
        query.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(job_type) = job_type {
        query.push(" AND type = ").push_bind(job_type.to_string());
    }
    query
        .push(" ORDER BY created_at DESC, rowid DESC LIMIT ")
        .push_bind(limit.max(0));

    let rows = query.build().fetch_all(pool).await?;
    rows.iter().map(job_from_row).collect()
}

/// Claim the oldest queued job for `worker_id`.
///
/// The select and the update are separate statements; the `status = 'queued'`
/// guard on the update makes the claim a compare-and-swap, so only one caller
/// can win a given row. Losing the race yields `None` without trying another row.
pub async fn claim_next_job(
    pool: &SqlitePool,
    worker_id: &str,
    now: f64,
) -> Result<Option<Job>, QueueError> {
    let next: Option<String> = sqlx::query_scalar(
        r#"
        SELECT id FROM jobs
        WHERE status = 'queued'
        ORDER BY created_at ASC, rowid ASC
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    let Some(job_id) = next else {
        return Ok(None);
    };

    let claimed = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'running',
            started_at = ?,
            worker_id = ?,
            updated_at = ?
        WHERE id = ? AND status = 'queued'
        "#,
    )
    .bind(now)
    .bind(worker_id)
    .bind(now)
    .bind(&job_id)
    .execute(pool)
    .await?;

    if claimed.rows_affected() == 0 {
        return Ok(None);
    }

    fetch_job(pool, &job_id).await
}

/// Rewrite the status and whichever optional fields are set in `update`.
///
/// Returns false when no job has that id.
pub async fn update_job_status(
    pool: &SqlitePool,
    job_id: Uuid,
    status: JobStatus,
    update: &JobUpdate,
    now: f64,
) -> Result<bool, QueueError> {
    let mut query = QueryBuilder::<Sqlite>::new("UPDATE jobs SET updated_at = ");
    query.push_bind(now);
    query.push(", status = ").push_bind(status.as_str());

    if status.is_terminal() {
        query.push(", finished_at = ").push_bind(now);
    }
    if let Some(result) = &update.result {
        query.push(", result = ").push_bind(serde_json::to_string(result)?);
    }
    if let Some(error) = &update.error {
        query.push(", error = ").push_bind(error.clone());
    }
    if let Some(progress) = &update.progress {
        query.push(", progress = ").push_bind(serde_json::to_string(progress)?);
    }
    if let Some(attempts) = update.attempts {
        query.push(", attempts = ").push_bind(attempts);
    }
    if update.release_worker {
        query.push(", worker_id = NULL");
    }
    query.push(" WHERE id = ").push_bind(job_id.to_string());

    let done = query.build().execute(pool).await?;
    Ok(done.rows_affected() > 0)
}

/// Overwrite the progress document of a running job.
///
/// Returns false when the job is not running (finished, or reclaimed by the sweep).
pub async fn update_job_progress(
    pool: &SqlitePool,
    job_id: Uuid,
    progress: &Value,
    now: f64,
) -> Result<bool, QueueError> {
    let done = sqlx::query(
        r#"
        UPDATE jobs
        SET progress = ?, updated_at = ?
        WHERE id = ? AND status = 'running'
        "#,
    )
    .bind(serde_json::to_string(progress)?)
    .bind(now)
    .bind(job_id.to_string())
    .execute(pool)
    .await?;

    Ok(done.rows_affected() > 0)
}

/// Return jobs stuck in `running` since `cutoff` or earlier to the queue.
pub async fn requeue_stale_jobs(
    pool: &SqlitePool,
    cutoff: f64,
    policy: StalePolicy,
    now: f64,
) -> Result<ReclaimOutcome, QueueError> {
    match policy {
        StalePolicy::Requeue => {
            let done = sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'queued',
                    worker_id = NULL,
                    updated_at = ?
                WHERE status = 'running' AND started_at <= ?
                "#,
            )
            .bind(now)
            .bind(cutoff)
            .execute(pool)
            .await?;

            Ok(ReclaimOutcome {
                requeued: done.rows_affected(),
                failed: 0,
            })
        }
        StalePolicy::CountAttempt => {
            let mut tx = pool.begin().await?;

            let failed = sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'failed',
                    attempts = attempts + 1,
                    error = ?,
                    finished_at = ?,
                    updated_at = ?
                WHERE status = 'running' AND started_at <= ? AND attempts + 1 >= max_attempts
                "#,
            )
            .bind(ABANDONED_ERROR)
            .bind(now)
            .bind(now)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

            let requeued = sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'queued',
                    attempts = attempts + 1,
                    worker_id = NULL,
                    updated_at = ?
                WHERE status = 'running' AND started_at <= ?
                "#,
            )
            .bind(now)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            Ok(ReclaimOutcome {
                requeued: requeued.rows_affected(),
                failed: failed.rows_affected(),
            })
        }
    }
}

/// Exact job counts per status
pub async fn count_jobs_by_status(pool: &SqlitePool) -> Result<JobStats, QueueError> {
    let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
        .fetch_all(pool)
        .await?;

    let mut stats = JobStats::default();
    for row in rows {
        let status: String = row.try_get("status")?;
        let n: i64 = row.try_get("n")?;
        match JobStatus::from_str(&status) {
            Ok(JobStatus::Queued) => stats.queued = n,
            Ok(JobStatus::Running) => stats.running = n,
            Ok(JobStatus::Succeeded) => stats.succeeded = n,
            Ok(JobStatus::Failed) => stats.failed = n,
            Err(_) => tracing::warn!(status = %status, count = n, "Ignoring unknown job status"),
        }
    }
    stats.total = stats.queued + stats.running + stats.succeeded + stats.failed;

    Ok(stats)
}

fn job_from_row(row: &SqliteRow) -> Result<Job, QueueError> {
    let key: String = row.try_get("id")?;
    let id = Uuid::parse_str(&key).map_err(|e| QueueError::corrupt(&key, e))?;

    let status: String = row.try_get("status")?;
    let status = JobStatus::from_str(&status)
        .map_err(|_| QueueError::corrupt(&key, format!("unknown status '{status}'")))?;

    let payload: String = row.try_get("payload")?;

    Ok(Job {
        id,
        job_type: row.try_get("type")?,
        status,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        requested_by: row.try_get("requested_by")?,
        payload: decode_document(&key, &payload)?,
        result: decode_optional(&key, row.try_get("result")?)?,
        error: row.try_get("error")?,
        progress: decode_optional(&key, row.try_get("progress")?)?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        worker_id: row.try_get("worker_id")?,
    })
}

fn decode_document(key: &str, text: &str) -> Result<Value, QueueError> {
    serde_json::from_str(text).map_err(|e| QueueError::corrupt(key, e))
}

fn decode_optional(key: &str, text: Option<String>) -> Result<Option<Value>, QueueError> {
    text.map(|t| decode_document(key, &t)).transpose()
}
