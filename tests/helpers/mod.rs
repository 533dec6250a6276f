//! Test helper utilities: isolated on-disk job stores.

#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

use publisher_jobs::db::{self, StoreConfig};
use publisher_jobs::services::queue::JobQueue;

/// A fresh job store in its own temporary directory.
///
/// Keep the `TempDir` alive for as long as the queue is used.
pub async fn temp_queue() -> (TempDir, JobQueue) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let queue = open_queue(&dir.path().join("jobs.db")).await;
    (dir, queue)
}

/// Open another handle on an existing store, as a separate process would.
pub async fn open_queue(path: &Path) -> JobQueue {
    open_queue_with(path, StoreConfig::default()).await
}

pub async fn open_queue_with(path: &Path, config: StoreConfig) -> JobQueue {
    let pool = db::open_store(path, &config)
        .await
        .expect("Failed to open job store");
    JobQueue::new(pool)
}

pub fn short_busy_timeout() -> StoreConfig {
    StoreConfig {
        busy_timeout: Duration::from_millis(100),
        max_connections: 2,
    }
}
