use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::db::StoreConfig;
use crate::models::job::StalePolicy;
use crate::services::command::CommandHandler;
use crate::services::worker::WorkerConfig;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:5000"). Unused by worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Path of the SQLite job database shared by the server and workers
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Seconds a writer waits on a locked database before giving up
    #[serde(default = "default_busy_timeout_secs")]
    pub db_busy_timeout_secs: u64,

    #[serde(default = "default_max_connections")]
    pub db_max_connections: u32,

    /// Worker identity; defaults to `worker-<pid>`
    pub worker_id: Option<String>,

    /// Seconds between polls while the queue is empty
    #[serde(default = "default_poll_interval")]
    pub worker_poll_interval: u64,

    /// Seconds after which a running job is presumed abandoned
    #[serde(default = "default_stale_job_timeout")]
    pub worker_stale_job_timeout: u64,

    /// Idle polls between stale-job sweeps
    #[serde(default = "default_reclaim_every")]
    pub worker_reclaim_every: u64,

    /// `requeue` or `count_attempt`
    #[serde(default)]
    pub worker_stale_policy: StalePolicy,

    /// Optional address for the worker's Prometheus listener (e.g., "0.0.0.0:9100")
    pub worker_metrics_addr: Option<String>,

    /// Handlers as `type=program arg ...`, separated by `;`. Quote words containing spaces.
    #[serde(default = "default_job_commands")]
    pub job_commands: String,

    /// Comma-separated job types the HTTP producer endpoint accepts; empty accepts any
    #[serde(default)]
    pub async_job_types: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("jobs.db")
}

fn default_busy_timeout_secs() -> u64 {
    10
}

fn default_max_connections() -> u32 {
    5
}

fn default_poll_interval() -> u64 {
    2
}

fn default_stale_job_timeout() -> u64 {
    600
}

fn default_reclaim_every() -> u64 {
    30
}

fn default_job_commands() -> String {
    "generate_amazon_content=python generate_amazon_content.py --csv products.csv --upload-images"
        .to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Ok(envy::from_env()?)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            busy_timeout: Duration::from_secs(self.db_busy_timeout_secs),
            max_connections: self.db_max_connections,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        let defaults = WorkerConfig::default();
        WorkerConfig {
            worker_id: self.worker_id.clone().unwrap_or(defaults.worker_id),
            poll_interval: Duration::from_secs(self.worker_poll_interval),
            stale_timeout: Duration::from_secs(self.worker_stale_job_timeout),
            reclaim_every: self.worker_reclaim_every,
            stale_policy: self.worker_stale_policy,
        }
    }

    pub fn job_commands(&self) -> Result<Vec<(String, CommandHandler)>, ConfigError> {
        parse_job_commands(&self.job_commands)
    }

    pub fn accepted_job_types(&self) -> HashSet<String> {
        self.async_job_types
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Parse `type=program arg ...;type2=program2 ...` into command handlers.
pub fn parse_job_commands(entries: &str) -> Result<Vec<(String, CommandHandler)>, ConfigError> {
    entries.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (job_type, command_line) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidJobCommand(entry.to_string()))?;
            let job_type = job_type.trim();
            if job_type.is_empty() {
                return Err(ConfigError::InvalidJobCommand(entry.to_string()));
            }
            let handler = CommandHandler::from_command_line(command_line)
                .ok_or_else(|| ConfigError::InvalidJobCommand(entry.to_string()))?;
            Ok((job_type.to_string(), handler))
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Environment error: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid job command '{0}', expected 'type=program [args...]'")]
    InvalidJobCommand(String),
}
