pub mod health;
pub mod jobs;
pub mod metrics;

use axum::routing::get;
use axum::Router;

use crate::app_state::AppState;

/// Job status and producer endpoints plus the health check.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/jobs", get(jobs::list_jobs).post(jobs::enqueue_job))
        .route("/api/jobs/stats", get(jobs::job_stats))
        .route("/api/jobs/{job_id}", get(jobs::get_job))
        .with_state(state)
}
