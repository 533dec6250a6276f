//! Job handlers and the registry the worker dispatches through.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::job::Job;
use crate::services::queue::{JobQueue, QueueError};

/// Work performed for one job type.
///
/// The returned value is stored as the job's result. Errors never escape the
/// worker; they are recorded on the job according to their class.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> Result<Value, HandlerError>;
}

/// Everything a handler gets to see about the job it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub job_type: String,
    pub payload: Value,
    /// 1-based number of this execution.
    pub attempt: i64,
    queue: JobQueue,
}

impl JobContext {
    pub fn new(job: &Job, queue: JobQueue) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            attempt: job.attempts + 1,
            queue,
        }
    }

    /// Publish intermediate status for pollers. Advisory only.
    ///
    /// Returns false once the job is no longer running.
    pub async fn report_progress(&self, progress: Value) -> Result<bool, QueueError> {
        self.queue.update_job_progress(self.job_id, &progress).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Counted against the job's retry budget.
    #[error("{0}")]
    Retryable(String),

    /// Retrying cannot help; the job fails immediately.
    #[error("{0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn retryable(msg: impl Display) -> Self {
        HandlerError::Retryable(msg.to_string())
    }

    pub fn permanent(msg: impl Display) -> Self {
        HandlerError::Permanent(msg.to_string())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, HandlerError::Permanent(_))
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        HandlerError::Retryable(format!("I/O error: {err}"))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Permanent(format!("Invalid payload: {err}"))
    }
}

impl From<QueueError> for HandlerError {
    fn from(err: QueueError) -> Self {
        HandlerError::Retryable(err.to_string())
    }
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> Result<Value, HandlerError> {
        (self.0)(ctx).await
    }
}

/// Dispatch table from job type tag to handler, built once at worker startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, job_type: impl Into<String>, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        let job_type = job_type.into();
        if self.handlers.insert(job_type.clone(), Arc::new(handler)).is_some() {
            tracing::warn!(job_type = %job_type, "Replacing previously registered handler");
        }
        self
    }

    pub fn register_fn<F, Fut>(&mut self, job_type: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register(job_type, FnHandler(f))
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    /// Registered type tags, sorted.
    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
