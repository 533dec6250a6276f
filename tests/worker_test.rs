//! Worker dispatch, retry policy and the polling loop.

mod helpers;

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use helpers::*;
use publisher_jobs::models::job::{JobStatus, StalePolicy};
use publisher_jobs::services::handlers::{HandlerError, HandlerRegistry};
use publisher_jobs::services::queue::JobQueue;
use publisher_jobs::services::worker::{JobOutcome, Worker, WorkerConfig};

fn test_config() -> WorkerConfig {
    WorkerConfig {
        worker_id: "test-worker".to_string(),
        poll_interval: Duration::from_millis(10),
        stale_timeout: Duration::from_secs(600),
        reclaim_every: 30,
        stale_policy: StalePolicy::Requeue,
    }
}

/// Registry with a `demo` handler that always fails, counting its calls.
fn failing_registry(calls: Arc<AtomicUsize>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register_fn("demo", move |_ctx| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<Value, _>(HandlerError::retryable("upstream API returned 503"))
        }
    });
    registry
}

#[tokio::test]
async fn test_always_failing_job_fails_after_max_attempts() {
    let (_dir, queue) = temp_queue().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let worker = Worker::new(queue.clone(), failing_registry(calls.clone()), test_config());

    let id = queue.enqueue("demo", &json!({"n": 3}), None, 2).await.unwrap();

    let first = worker.poll_once().await.unwrap();
    assert_eq!(first, Some(JobOutcome::Requeued { attempts: 1 }));
    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.worker_id.is_none());
    assert_eq!(job.error.as_deref(), Some("upstream API returned 503"));

    let second = worker.poll_once().await.unwrap();
    assert_eq!(second, Some(JobOutcome::Failed { attempts: 2 }));

    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 2);
    assert!(!job.error.unwrap_or_default().is_empty());
    assert!(job.finished_at.is_some());
    assert!(job.result.is_none());

    assert_eq!(worker.poll_once().await.unwrap(), None);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_default_retry_budget_runs_handler_three_times() {
    let (_dir, queue) = temp_queue().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let worker = Worker::new(queue.clone(), failing_registry(calls.clone()), test_config());

    let id = queue.enqueue("demo", &json!({}), None, 3).await.unwrap();
    while worker.poll_once().await.unwrap().is_some() {}

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
}

#[tokio::test]
async fn test_successful_job_records_result_and_progress() {
    let (_dir, queue) = temp_queue().await;

    let mut registry = HandlerRegistry::new();
    registry.register_fn("generate_amazon_content", |ctx| async move {
        ctx.report_progress(json!({"stage": "uploading", "current": 7, "total": 40}))
            .await?;
        let m_number = ctx.payload["m_number"].as_str().unwrap_or_default().to_string();
        Ok::<Value, HandlerError>(json!({"m_number": m_number, "attempt": ctx.attempt}))
    });
    let worker = Worker::new(queue.clone(), registry, test_config());

    let id = queue
        .enqueue("generate_amazon_content", &json!({"m_number": "M1042"}), None, 3)
        .await
        .unwrap();

    assert_eq!(worker.poll_once().await.unwrap(), Some(JobOutcome::Succeeded));

    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.result, Some(json!({"m_number": "M1042", "attempt": 1})));
    assert_eq!(job.progress, Some(json!({"stage": "uploading", "current": 7, "total": 40})));
    assert_eq!(job.worker_id.as_deref(), Some("test-worker"));
    assert_eq!(job.attempts, 0);
    assert!(job.finished_at.is_some());
}

#[tokio::test]
async fn test_unknown_job_type_fails_without_retry() {
    let (_dir, queue) = temp_queue().await;
    let worker = Worker::new(queue.clone(), HandlerRegistry::new(), test_config());

    let id = queue.enqueue("resize_images", &json!({}), None, 3).await.unwrap();

    assert_eq!(worker.poll_once().await.unwrap(), Some(JobOutcome::Rejected));
    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("Unknown job type: resize_images"));
    assert_eq!(job.attempts, 0);
    assert!(job.finished_at.is_some());

    assert_eq!(worker.poll_once().await.unwrap(), None);
}

#[tokio::test]
async fn test_permanent_error_skips_remaining_attempts() {
    let (_dir, queue) = temp_queue().await;

    let mut registry = HandlerRegistry::new();
    registry.register_fn("demo", |_ctx| async {
        Err::<Value, _>(HandlerError::permanent("product M9999 does not exist"))
    });
    let worker = Worker::new(queue.clone(), registry, test_config());

    let id = queue.enqueue("demo", &json!({}), None, 5).await.unwrap();

    assert_eq!(
        worker.poll_once().await.unwrap(),
        Some(JobOutcome::Failed { attempts: 1 })
    );
    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("product M9999 does not exist"));
}

#[tokio::test]
async fn test_panicking_handler_is_contained() {
    let (_dir, queue) = temp_queue().await;

    let mut registry = HandlerRegistry::new();
    registry.register_fn("demo", |ctx| async move {
        if ctx.attempt == 1 {
            panic!("image template missing");
        }
        Ok::<Value, HandlerError>(json!("recovered"))
    });
    let worker = Worker::new(queue.clone(), registry, test_config());

    let id = queue.enqueue("demo", &json!({}), None, 3).await.unwrap();

    assert_eq!(
        worker.poll_once().await.unwrap(),
        Some(JobOutcome::Requeued { attempts: 1 })
    );
    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(
        job.error.as_deref(),
        Some("Handler panicked: image template missing")
    );

    assert_eq!(worker.poll_once().await.unwrap(), Some(JobOutcome::Succeeded));
    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.result, Some(json!("recovered")));
    // The error of the failed attempt is kept for diagnostics.
    assert!(job.error.is_some());
}

#[tokio::test]
async fn test_worker_reclaims_jobs_from_crashed_worker() {
    let (_dir, queue) = temp_queue().await;

    let mut registry = HandlerRegistry::new();
    registry.register_fn("demo", |_ctx| async { Ok::<Value, HandlerError>(json!({"ok": true})) });
    let config = WorkerConfig {
        stale_timeout: Duration::from_millis(10),
        ..test_config()
    };
    let worker = Worker::new(queue.clone(), registry, config);

    let id = queue.enqueue("demo", &json!({}), None, 3).await.unwrap();
    queue.claim_next_job("crashed-worker").await.unwrap().unwrap();
    assert_eq!(worker.poll_once().await.unwrap(), None);

    tokio::time::sleep(Duration::from_millis(30)).await;
    let outcome = worker.reclaim_stale().await.unwrap();
    assert_eq!(outcome.requeued, 1);

    assert_eq!(worker.poll_once().await.unwrap(), Some(JobOutcome::Succeeded));
    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.worker_id.as_deref(), Some("test-worker"));
}

#[tokio::test]
async fn test_outcome_write_waits_out_a_locked_store() {
    let (dir, queue) = temp_queue().await;
    let impatient = open_queue_with(&dir.path().join("jobs.db"), short_busy_timeout()).await;

    // The handler finishes while another connection holds the write lock,
    // which is only released well past the worker's busy timeout.
    let locker = queue.clone();
    let mut registry = HandlerRegistry::new();
    registry.register_fn("upload_listings", move |_ctx| {
        let locker = locker.clone();
        async move {
            let mut conn = locker.pool().acquire().await.unwrap();
            sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await.unwrap();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(400)).await;
                sqlx::query("ROLLBACK").execute(&mut *conn).await.unwrap();
            });
            Ok::<Value, HandlerError>(json!({"uploaded": 40}))
        }
    });
    let worker = Worker::new(impatient, registry, test_config());

    let id = queue.enqueue("upload_listings", &json!({}), None, 3).await.unwrap();

    let outcome = worker.poll_once().await.unwrap();
    assert_eq!(outcome, Some(JobOutcome::Succeeded));

    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.result, Some(json!({"uploaded": 40})));
    assert_eq!(job.attempts, 0);
    assert!(job.finished_at.is_some());
}

async fn wait_for_terminal(queue: &JobQueue, ids: &[uuid::Uuid]) {
    for _ in 0..500 {
        let mut done = true;
        for id in ids {
            let job = queue.get_job(*id).await.unwrap().unwrap();
            done &= job.status.is_terminal();
        }
        if done {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("jobs did not finish in time");
}

#[tokio::test]
async fn test_run_loop_processes_jobs_until_shutdown() {
    let (_dir, queue) = temp_queue().await;

    let mut registry = HandlerRegistry::new();
    registry.register_fn("double", |ctx| async move {
        let n = ctx.payload["n"].as_i64().ok_or_else(|| HandlerError::permanent("n missing"))?;
        Ok::<Value, HandlerError>(json!(n * 2))
    });
    let worker = Worker::new(queue.clone(), registry, test_config());

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let running = tokio::spawn(async move {
        worker
            .run(async move {
                let _ = stop_rx.await;
            })
            .await;
    });

    let mut ids = Vec::new();
    for n in 1..=3 {
        ids.push(queue.enqueue("double", &json!({"n": n}), None, 3).await.unwrap());
    }
    ids.push(queue.enqueue("double", &json!({}), None, 3).await.unwrap());

    wait_for_terminal(&queue, &ids).await;

    for (n, id) in ids[..3].iter().enumerate() {
        let job = queue.get_job(*id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.result, Some(json!((n as i64 + 1) * 2)));
    }
    let bad = queue.get_job(ids[3]).await.unwrap().unwrap();
    assert_eq!(bad.status, JobStatus::Failed);
    assert_eq!(bad.error.as_deref(), Some("n missing"));

    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("worker did not shut down")
        .expect("worker task panicked");
}

#[cfg(unix)]
mod command_handler {
    use super::*;
    use publisher_jobs::services::command::CommandHandler;

    fn command_worker(queue: &JobQueue, job_type: &str, handler: CommandHandler) -> Worker {
        let mut registry = HandlerRegistry::new();
        registry.register(job_type, handler);
        Worker::new(queue.clone(), registry, test_config())
    }

    #[tokio::test]
    async fn test_command_receives_payload_on_stdin() {
        let (_dir, queue) = temp_queue().await;
        let worker = command_worker(&queue, "echo", CommandHandler::new("sh", ["-c", "cat"]));

        let payload = json!({"m_number": "M1042", "upload_images": true});
        let id = queue.enqueue("echo", &payload, None, 3).await.unwrap();

        assert_eq!(worker.poll_once().await.unwrap(), Some(JobOutcome::Succeeded));
        let job = queue.get_job(id).await.unwrap().unwrap();
        let result = job.result.expect("result stored");
        let echoed: Value = serde_json::from_str(result["output"].as_str().unwrap()).unwrap();
        assert_eq!(echoed, payload);
        assert!(result["duration_seconds"].as_f64().is_some());
        assert_eq!(job.progress, Some(json!({"stage": "starting"})));
    }

    #[tokio::test]
    async fn test_command_sees_job_environment() {
        let (_dir, queue) = temp_queue().await;
        let worker = command_worker(
            &queue,
            "env_check",
            CommandHandler::new("sh", ["-c", "printf '%s/%s' \"$JOB_TYPE\" \"$JOB_ATTEMPT\""]),
        );

        let id = queue.enqueue("env_check", &json!({}), None, 3).await.unwrap();
        worker.poll_once().await.unwrap();

        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.result.unwrap()["output"], "env_check/1");
    }

    #[tokio::test]
    async fn test_command_failure_is_permanent() {
        let (_dir, queue) = temp_queue().await;
        let worker = command_worker(
            &queue,
            "broken",
            CommandHandler::new("sh", ["-c", "echo 'products.csv not found' >&2; exit 3"]),
        );

        let id = queue.enqueue("broken", &json!({}), None, 3).await.unwrap();
        assert_eq!(
            worker.poll_once().await.unwrap(),
            Some(JobOutcome::Failed { attempts: 1 })
        );
        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.error.as_deref(), Some("products.csv not found"));
    }

    #[tokio::test]
    async fn test_missing_program_is_retried() {
        let (_dir, queue) = temp_queue().await;
        let worker = command_worker(
            &queue,
            "missing",
            CommandHandler::new("/nonexistent/generate_listing", Vec::<String>::new()),
        );

        queue.enqueue("missing", &json!({}), None, 3).await.unwrap();
        assert_eq!(
            worker.poll_once().await.unwrap(),
            Some(JobOutcome::Requeued { attempts: 1 })
        );
    }
}
