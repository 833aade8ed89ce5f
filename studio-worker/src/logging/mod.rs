//! Logging setup: env-driven filter, local-time console output and optional
//! daily-rolling log files.

use chrono::{Local, Utc};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::LoggingSettings;
use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "studio_worker=info,sqlx=warn";

/// Prefix of the rolling log files.
const LOG_FILE_PREFIX: &str = "studio-worker.log";

/// Log retention period in days.
const LOG_RETENTION_DAYS: i64 = 7;

/// Formats timestamps in the host's local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Keeps the non-blocking file writer alive; drop it last so buffered lines are flushed.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

impl LoggingGuard {
    pub fn writes_files(&self) -> bool {
        self._file.is_some()
    }
}

fn build_filter(settings: &LoggingSettings) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = settings.filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER);
    EnvFilter::try_new(directive)
        .map_err(|e| Error::config(format!("Invalid filter directive '{directive}': {e}")))
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `settings.filter`. Fails if a subscriber is already set.
pub fn init_logging(settings: &LoggingSettings) -> Result<LoggingGuard> {
    let filter = build_filter(settings)?;

    let console = if settings.json {
        fmt::layer().json().with_timer(LocalTimer).boxed()
    } else {
        fmt::layer().with_ansi(true).with_timer(LocalTimer).boxed()
    };

    let (file, guard) = match &settings.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to set global default subscriber: {}", e)))?;

    Ok(LoggingGuard { _file: guard })
}

/// Periodically delete rolled log files older than the retention window.
pub fn spawn_retention_cleanup(log_dir: &Path, cancel_token: CancellationToken) {
    let log_dir = log_dir.to_path_buf();

    tokio::spawn(async move {
        let cleanup_interval = Duration::from_secs(24 * 60 * 60);

        loop {
            if let Err(e) = cleanup_old_logs(&log_dir, LOG_RETENTION_DAYS).await {
                warn!(error = %e, "Failed to cleanup old logs");
            }

            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Log retention cleanup task shutting down");
                    break;
                }
                _ = tokio::time::sleep(cleanup_interval) => {}
            }
        }
    });
}

/// Date suffix of a rolled log file name, if it is one of ours.
fn rolled_file_date(filename: &str) -> Option<chrono::NaiveDate> {
    let date_str = filename
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_prefix('.')?;
    chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d").ok()
}

async fn cleanup_old_logs(log_dir: &Path, retention_days: i64) -> std::io::Result<usize> {
    let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).date_naive();

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted_count = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(file_date) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(rolled_file_date)
        else {
            continue;
        };

        if file_date < cutoff {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    deleted_count += 1;
                    debug!(path = %path.display(), "Deleted old log file");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to delete old log file")
                }
            }
        }
    }

    if deleted_count > 0 {
        info!(count = deleted_count, "Cleaned up old log files");
    }

    Ok(deleted_count)
}
