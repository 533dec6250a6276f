use garde::Validate;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use uuid::Uuid;

use super::job::{format_timestamp, Job, JobStatus, DEFAULT_MAX_ATTEMPTS};

pub const DEFAULT_LIST_LIMIT: i64 = 50;

/// Request to enqueue a job from the producer side.
#[derive(Debug, Deserialize, Validate)]
pub struct EnqueueRequest {
    #[garde(length(min = 1, max = 100))]
    #[serde(rename = "type")]
    pub job_type: String,

    #[garde(skip)]
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,

    #[garde(length(min = 1, max = 200))]
    pub requested_by: Option<String>,

    #[garde(range(min = 1, max = 100))]
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
}

fn empty_payload() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

fn default_max_attempts() -> i64 {
    DEFAULT_MAX_ATTEMPTS
}

/// Response after a job has been accepted for async processing.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub mode: &'static str,
    pub job_id: Uuid,
    pub status_url: String,
    pub message: String,
}

impl EnqueueResponse {
    pub fn accepted(job_id: Uuid) -> Self {
        Self {
            mode: "async",
            job_id,
            status_url: format!("/api/jobs/{job_id}"),
            message: "Job queued successfully. Check status at the provided URL.".to_string(),
        }
    }
}

/// Query string for `GET /api/jobs`. A blank parameter means no filter.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct ListJobsQuery {
    #[garde(skip)]
    #[serde(default, deserialize_with = "blank_as_none")]
    pub status: Option<JobStatus>,

    #[garde(length(min = 1, max = 100))]
    #[serde(rename = "type", default, deserialize_with = "blank_as_none")]
    pub job_type: Option<String>,

    #[garde(range(min = 1, max = 10_000))]
    #[serde(default, deserialize_with = "blank_as_none")]
    pub limit: Option<i64>,
}

fn blank_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    match Option::<String>::deserialize(deserializer)?.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

impl ListJobsQuery {
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT)
    }
}

/// Job detail enriched with human-readable timestamps.
#[derive(Debug, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at_formatted: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at_formatted: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at_formatted: Option<String>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            created_at_formatted: format_timestamp(job.created_at),
            started_at_formatted: job.started_at.and_then(format_timestamp),
            finished_at_formatted: job.finished_at.and_then(format_timestamp),
            job,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListFilters {
    pub status: Option<JobStatus>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub limit: i64,
}

/// Response for `GET /api/jobs`.
#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobView>,
    pub count: usize,
    pub filters: ListFilters,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
