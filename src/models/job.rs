use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default retry budget for a freshly enqueued job.
pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;

/// Lifecycle state of a job in the durable queue.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    /// Succeeded and failed jobs are never picked up again by a worker.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// A unit of asynchronous work tracked by the queue.
///
/// Timestamps are seconds since the Unix epoch with sub-second precision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: JobStatus,
    pub created_at: f64,
    pub updated_at: f64,
    pub started_at: Option<f64>,
    pub finished_at: Option<f64>,
    pub requested_by: Option<String>,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub progress: Option<serde_json::Value>,
    pub attempts: i64,
    pub max_attempts: i64,
    pub worker_id: Option<String>,
}

impl Job {
    /// True when another failed attempt would still leave retry budget.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Fields rewritten by a partial status update. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub progress: Option<serde_json::Value>,
    pub attempts: Option<i64>,
    /// Clear `worker_id`, used when a job goes back to the queue.
    pub release_worker: bool,
}

impl JobUpdate {
    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_progress(mut self, progress: serde_json::Value) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_attempts(mut self, attempts: i64) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn release_worker(mut self) -> Self {
        self.release_worker = true;
        self
    }
}

/// Number of jobs in each status bucket.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobStats {
    pub queued: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub total: i64,
}

/// What the stale-job sweep does with a job abandoned in `running`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StalePolicy {
    /// Put the job back in the queue without touching `attempts`.
    #[default]
    Requeue,
    /// Count the abandoned run as a failed attempt; jobs out of attempts become `failed`.
    CountAttempt,
}

/// Rows touched by one stale-job sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimOutcome {
    pub requeued: u64,
    pub failed: u64,
}

/// Current wall-clock time as fractional epoch seconds.
pub fn now_secs() -> f64 {
    epoch_secs(Utc::now())
}

pub fn epoch_secs(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

/// Render an epoch timestamp as `YYYY-MM-DD HH:MM:SS` (UTC).
pub fn format_timestamp(secs: f64) -> Option<String> {
    if !secs.is_finite() {
        return None;
    }
    let micros = (secs * 1_000_000.0).round() as i64;
    DateTime::<Utc>::from_timestamp_micros(micros).map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}
