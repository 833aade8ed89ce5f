use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use studio_worker::config::{DatabaseConfig, LoggingSettings, WorkerConfig};
use studio_worker::database::{self, SqlxContentStore, SqlxJobQueue};
use studio_worker::logging;
use studio_worker::notification::BroadcastNotifier;
use studio_worker::worker::{HandlerRegistry, Worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let logging_settings = LoggingSettings::from_env_or_default();
    let log_guard = logging::init_logging(&logging_settings)?;
    let cleanup_token = CancellationToken::new();
    if let Some(dir) = &logging_settings.log_dir {
        logging::spawn_retention_cleanup(dir, cleanup_token.clone());
    }

    let config = WorkerConfig::from_env_or_default();
    config.validate()?;

    let pool = database::connect(&DatabaseConfig::from_env_or_default()).await?;

    let handlers = HandlerRegistry::from_env();
    if handlers.is_empty() {
        warn!("No JOB_HANDLER_* commands configured");
    }

    let worker = Worker::builder(
        Arc::new(SqlxJobQueue::new(pool.clone())),
        Arc::new(SqlxContentStore::new(pool.clone())),
    )
    .notifier(Arc::new(BroadcastNotifier::new()))
    .handlers(handlers)
    .config(config)
    .build()?;

    worker.start().await;
    info!("studio-worker running");

    let exit_code = tokio::select! {
        _ = shutdown_signal() => {
            let report = worker.stop().await;
            info!(
                drained = report.drained,
                remaining_jobs = report.remaining_jobs,
                "Shutdown complete"
            );
            0
        }
        result = worker.wait() => match result {
            Ok(()) => 0,
            Err(e) => {
                worker.stop().await;
                error!(error = %e, "Worker stopped after a fatal error");
                1
            }
        },
    };

    cleanup_token.cancel();
    pool.close().await;

    if exit_code != 0 {
        drop(log_guard);
        std::process::exit(exit_code);
    }
    Ok(())
}

/// Wait for SIGTERM or Ctrl+C.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler, falling back to Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
            info!("SIGINT received, starting graceful shutdown");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, starting graceful shutdown");
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received, starting graceful shutdown");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received, starting graceful shutdown");
}
