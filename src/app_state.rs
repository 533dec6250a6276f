use std::collections::HashSet;
use std::sync::Arc;

use crate::services::queue::JobQueue;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: JobQueue,
    /// Job types the producer endpoint accepts; empty accepts any.
    pub accepted_job_types: Arc<HashSet<String>>,
}

impl AppState {
    pub fn new(queue: JobQueue, accepted_job_types: HashSet<String>) -> Self {
        Self {
            queue,
            accepted_job_types: Arc::new(accepted_job_types),
        }
    }

    pub fn accepts(&self, job_type: &str) -> bool {
        self.accepted_job_types.is_empty() || self.accepted_job_types.contains(job_type)
    }
}
