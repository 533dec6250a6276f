use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

use publisher_jobs::{
    config::AppConfig,
    db,
    services::{handlers::HandlerRegistry, queue::JobQueue, worker::Worker},
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting job worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    if let Some(addr) = &config.worker_metrics_addr {
        let addr: SocketAddr = addr.parse().expect("Invalid WORKER_METRICS_ADDR");
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to install Prometheus exporter");
        tracing::info!(%addr, "Serving worker metrics");
    }

    // Open the job store
    tracing::info!(path = %config.database_path.display(), "Opening job store");
    let pool = db::open_store(&config.database_path, &config.store_config())
        .await
        .expect("Failed to open job store");

    // Build the handler dispatch table
    let mut registry = HandlerRegistry::new();
    for (job_type, handler) in config.job_commands().expect("Invalid JOB_COMMANDS") {
        tracing::info!(
            job_type = %job_type,
            program = %handler.program(),
            "Registering command handler"
        );
        registry.register(job_type, handler);
    }
    if registry.is_empty() {
        tracing::warn!("No job handlers registered; every claimed job will be rejected");
    }

    let worker = Worker::new(JobQueue::new(pool), registry, config.worker_config());

    tracing::info!(worker_id = %worker.id(), "Worker ready, starting job processing loop");
    worker.run(shutdown_signal()).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
