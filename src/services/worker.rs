//! The polling worker: claims queued jobs, runs their handlers and records the
//! outcome.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use uuid::Uuid;

use crate::models::job::{Job, JobStatus, JobUpdate, ReclaimOutcome, StalePolicy};
use crate::services::handlers::{HandlerError, HandlerRegistry, JobContext};
use crate::services::queue::{JobQueue, QueueError};

const WRITE_BACK_INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const WRITE_BACK_MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Sleep between polls while the queue is empty.
    pub poll_interval: Duration,
    /// A job running longer than this is presumed abandoned.
    pub stale_timeout: Duration,
    /// Run the stale sweep every this many idle polls. Zero disables it.
    pub reclaim_every: u64,
    pub stale_policy: StalePolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", std::process::id()),
            poll_interval: Duration::from_secs(2),
            stale_timeout: Duration::from_secs(600),
            reclaim_every: 30,
            stale_policy: StalePolicy::Requeue,
        }
    }
}

/// How a claimed job left the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    /// Handler failed with attempts to spare; back in the queue.
    Requeued { attempts: i64 },
    Failed { attempts: i64 },
    /// No handler registered for the job type.
    Rejected,
}

pub struct Worker {
    queue: JobQueue,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(queue: JobQueue, registry: HandlerRegistry, config: WorkerConfig) -> Self {
        Self {
            queue,
            registry: Arc::new(registry),
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.worker_id
    }

    /// Poll until `shutdown` resolves.
    ///
    /// A job in flight when shutdown fires is abandoned in `running` and picked
    /// up again by the stale sweep.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tracing::info!(
            worker_id = %self.config.worker_id,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            stale_timeout_secs = self.config.stale_timeout.as_secs(),
            stale_policy = %self.config.stale_policy,
            job_types = ?self.registry.job_types(),
            "Worker starting"
        );

        tokio::pin!(shutdown);
        let mut idle_polls: u64 = 0;

        loop {
            let idle = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                idle = self.tick(&mut idle_polls) => idle,
            };

            if idle {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => break,
                    _ = sleep(self.config.poll_interval) => {}
                }
            }
        }

        tracing::info!(worker_id = %self.config.worker_id, "Worker shutting down");
    }

    /// One loop iteration. Returns true when the worker should sleep before the next poll.
    async fn tick(&self, idle_polls: &mut u64) -> bool {
        if self.config.reclaim_every > 0 && *idle_polls % self.config.reclaim_every == 0 {
            if let Err(e) = self.reclaim_stale().await {
                tracing::error!(error = %e, "Stale job sweep failed");
            }
        }

        match self.poll_once().await {
            Ok(Some(outcome)) => {
                tracing::debug!(?outcome, "Job processed, checking for next job");
                *idle_polls = 0;
                false
            }
            Ok(None) => {
                *idle_polls += 1;
                if *idle_polls == 1 {
                    tracing::info!("No jobs in queue, waiting");
                }
                true
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    retryable = e.is_retryable(),
                    "Error polling job queue, will retry"
                );
                true
            }
        }
    }

    /// Claim at most one job and process it. `None` when nothing was claimed.
    pub async fn poll_once(&self) -> Result<Option<JobOutcome>, QueueError> {
        match self.queue.claim_next_job(&self.config.worker_id).await? {
            Some(job) => self.process_job(job).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run the stale-job sweep with this worker's timeout and policy.
    pub async fn reclaim_stale(&self) -> Result<ReclaimOutcome, QueueError> {
        let outcome = self
            .queue
            .requeue_stale_jobs(self.config.stale_timeout, self.config.stale_policy)
            .await?;
        metrics::counter!("jobs_reclaimed_total").increment(outcome.requeued + outcome.failed);
        Ok(outcome)
    }

    /// Dispatch a claimed job to its handler and write back the outcome.
    pub async fn process_job(&self, job: Job) -> Result<JobOutcome, QueueError> {
        tracing::info!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts + 1,
            max_attempts = job.max_attempts,
            "Processing job"
        );
        metrics::counter!("jobs_claimed_total", "job_type" => job.job_type.clone()).increment(1);

        let Some(handler) = self.registry.get(&job.job_type) else {
            let error = format!("Unknown job type: {}", job.job_type);
            self.write_back(job.id, JobStatus::Failed, JobUpdate::default().with_error(&error))
                .await?;
            metrics::counter!("jobs_failed_total", "job_type" => job.job_type.clone()).increment(1);
            tracing::error!(job_id = %job.id, error = %error, "Job rejected");
            return Ok(JobOutcome::Rejected);
        };

        let ctx = JobContext::new(&job, self.queue.clone());
        let start = Instant::now();
        // Own task so a panicking handler cannot take the worker down with it.
        let run = tokio::spawn(async move { handler.handle(ctx).await }).await;
        let elapsed = start.elapsed();
        metrics::histogram!("job_processing_seconds", "job_type" => job.job_type.clone())
            .record(elapsed.as_secs_f64());

        let failure = match run {
            Ok(Ok(result)) => {
                self.write_back(job.id, JobStatus::Succeeded, JobUpdate::default().with_result(result))
                    .await?;
                metrics::counter!("jobs_succeeded_total", "job_type" => job.job_type.clone())
                    .increment(1);
                tracing::info!(
                    job_id = %job.id,
                    duration_ms = elapsed.as_millis() as u64,
                    "Job succeeded"
                );
                return Ok(JobOutcome::Succeeded);
            }
            Ok(Err(e)) => e,
            Err(join_err) => HandlerError::Retryable(panic_message(join_err)),
        };

        self.record_failure(&job, failure).await
    }

    async fn record_failure(&self, job: &Job, failure: HandlerError) -> Result<JobOutcome, QueueError> {
        let attempts = job.attempts + 1;
        let error = failure.to_string();

        if failure.is_permanent() || attempts >= job.max_attempts {
            self.write_back(
                job.id,
                JobStatus::Failed,
                JobUpdate::default().with_error(&error).with_attempts(attempts),
            )
            .await?;
            metrics::counter!("jobs_failed_total", "job_type" => job.job_type.clone()).increment(1);
            tracing::error!(
                job_id = %job.id,
                attempts,
                permanent = failure.is_permanent(),
                error = %error,
                "Job failed permanently"
            );
            Ok(JobOutcome::Failed { attempts })
        } else {
            self.write_back(
                job.id,
                JobStatus::Queued,
                JobUpdate::default()
                    .with_error(&error)
                    .with_attempts(attempts)
                    .release_worker(),
            )
            .await?;
            metrics::counter!("jobs_requeued_total", "job_type" => job.job_type.clone()).increment(1);
            tracing::warn!(
                job_id = %job.id,
                attempts,
                max_attempts = job.max_attempts,
                error = %error,
                "Job failed, requeued for retry"
            );
            Ok(JobOutcome::Requeued { attempts })
        }
    }

    /// Record a job outcome, retrying with backoff while the store is busy.
    ///
    /// Runs until the write lands or fails for a non-busy reason. Shutdown
    /// cancels it along with the rest of the tick.
    async fn write_back(&self, id: Uuid, status: JobStatus, update: JobUpdate) -> Result<(), QueueError> {
        let mut backoff = WRITE_BACK_INITIAL_BACKOFF;
        loop {
            match self.queue.update_job_status(id, status, update.clone()).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    metrics::counter!("job_write_back_retries_total").increment(1);
                    tracing::warn!(
                        job_id = %id,
                        status = %status,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Job store busy, retrying outcome write"
                    );
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(WRITE_BACK_MAX_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return "Handler task was cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("Handler panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("Handler panicked: {msg}")
    } else {
        "Handler panicked".to_string()
    }
}
