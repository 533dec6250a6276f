use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::api::{
    EnqueueRequest, EnqueueResponse, ErrorResponse, JobListResponse, JobView, ListFilters,
    ListJobsQuery,
};
use crate::models::job::JobStats;
use crate::services::queue::QueueError;

/// Errors surfaced by the job endpoints.
#[derive(Debug)]
pub enum ApiError {
    NotFound,
    BadRequest(String),
    Unprocessable(String),
    Store(QueueError),
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        ApiError::Store(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Job not found".to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Store(e) => {
                tracing::error!(error = %e, "Job store error");
                let status = if e.is_retryable() {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                (status, e.to_string())
            }
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

/// GET /api/jobs/{job_id}: status and details of one job.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    // Ids are always UUIDs, so anything else cannot exist.
    let job_id = Uuid::parse_str(&job_id).map_err(|_| ApiError::NotFound)?;

    let job = state.queue.get_job(job_id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(JobView::from(job)))
}

/// GET /api/jobs: newest jobs first, filtered by `status` and `type`.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobListResponse>, ApiError> {
    query
        .validate()
        .map_err(|report| ApiError::BadRequest(report.to_string()))?;

    let limit = query.limit();
    let jobs = state
        .queue
        .list_jobs(query.status, query.job_type.as_deref(), limit)
        .await?;

    let jobs: Vec<JobView> = jobs.into_iter().map(JobView::from).collect();
    Ok(Json(JobListResponse {
        count: jobs.len(),
        jobs,
        filters: ListFilters {
            status: query.status,
            job_type: query.job_type,
            limit,
        },
    }))
}

/// GET /api/jobs/stats: number of jobs per status.
pub async fn job_stats(State(state): State<AppState>) -> Result<Json<JobStats>, ApiError> {
    Ok(Json(state.queue.job_stats().await?))
}

/// POST /api/jobs: enqueue a job for the workers; answers 202 immediately.
pub async fn enqueue_job(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    request
        .validate()
        .map_err(|report| ApiError::Unprocessable(report.to_string()))?;

    if !state.accepts(&request.job_type) {
        return Err(ApiError::Unprocessable(format!(
            "Job type '{}' is not accepted for async processing",
            request.job_type
        )));
    }

    let job_id = state
        .queue
        .enqueue(
            &request.job_type,
            &request.payload,
            request.requested_by.as_deref(),
            request.max_attempts,
        )
        .await?;

    metrics::counter!("jobs_enqueued_total", "job_type" => request.job_type.clone()).increment(1);
    tracing::info!(job_id = %job_id, job_type = %request.job_type, "Job queued");

    Ok((StatusCode::ACCEPTED, Json(EnqueueResponse::accepted(job_id))))
}
