use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;

use crate::services::queue::QueueError;

/// Connection settings for the job store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long a writer waits on a locked database before failing with busy.
    pub busy_timeout: Duration,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(10),
            max_connections: 5,
        }
    }
}

/// Open the SQLite job store at `path`, creating it if needed, and apply migrations.
///
/// The database runs in WAL mode so the web process can keep reading while a
/// worker writes.
pub async fn open_store(path: &Path, config: &StoreConfig) -> Result<SqlitePool, QueueError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(config.busy_timeout);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .acquire_timeout(config.busy_timeout)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;
    Ok(pool)
}

/// Run database migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), QueueError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub mod queries;
