//! Process configuration.
//!
//! Every knob is read from the environment (after `.env` is loaded) and falls
//! back to its default when the variable is absent or cannot be parsed.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Default SQLite database URL.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:studio.db?mode=rwc";

/// Engine tuning, fixed for the lifetime of one worker run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Delay between poll cycles; also the first supervisor backoff step.
    pub poll_interval: Duration,
    /// Upper bound on jobs executing at once.
    pub max_concurrent_jobs: usize,
    /// Consecutive poll-loop faults tolerated before the worker gives up.
    pub max_consecutive_errors: u32,
    /// Ceiling for the supervisor's exponential backoff.
    pub backoff_cap: Duration,
    /// Jobs processing for longer than this are presumed abandoned.
    pub stale_job_max_age: Duration,
    /// The stale job reaper runs once every this many poll cycles.
    pub stale_check_every_n_polls: u64,
    /// Upper bound on how long `stop()` waits for in-flight jobs.
    pub drain_timeout: Duration,
    /// How often the drain checks the in-flight count.
    pub drain_poll: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(3_000),
            max_concurrent_jobs: 5,
            max_consecutive_errors: 10,
            backoff_cap: Duration::from_millis(60_000),
            stale_job_max_age: Duration::from_millis(30 * 60 * 1000), // 30 minutes
            stale_check_every_n_polls: 100,
            drain_timeout: Duration::from_millis(30_000),
            drain_poll: Duration::from_millis(500),
        }
    }
}

impl WorkerConfig {
    /// Load worker config from environment variables, falling back to defaults.
    ///
    /// Supported env vars:
    /// - `WORKER_POLL_INTERVAL_MS`
    /// - `WORKER_MAX_CONCURRENT_JOBS`
    /// - `WORKER_MAX_CONSECUTIVE_ERRORS`
    /// - `WORKER_BACKOFF_CAP_MS`
    /// - `WORKER_STALE_JOB_MAX_AGE_MS`
    /// - `WORKER_STALE_CHECK_EVERY_N_POLLS`
    /// - `WORKER_DRAIN_TIMEOUT_MS`
    /// - `WORKER_DRAIN_POLL_MS`
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env_parse::<u64>("WORKER_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(max) = env_parse::<usize>("WORKER_MAX_CONCURRENT_JOBS") {
            config.max_concurrent_jobs = max;
        }
        if let Some(max) = env_parse::<u32>("WORKER_MAX_CONSECUTIVE_ERRORS") {
            config.max_consecutive_errors = max;
        }
        if let Some(ms) = env_parse::<u64>("WORKER_BACKOFF_CAP_MS") {
            config.backoff_cap = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("WORKER_STALE_JOB_MAX_AGE_MS") {
            config.stale_job_max_age = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<u64>("WORKER_STALE_CHECK_EVERY_N_POLLS") {
            config.stale_check_every_n_polls = n;
        }
        if let Some(ms) = env_parse::<u64>("WORKER_DRAIN_TIMEOUT_MS") {
            config.drain_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("WORKER_DRAIN_POLL_MS") {
            config.drain_poll = Duration::from_millis(ms);
        }

        config
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::config("poll interval must be greater than zero"));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(Error::config("max concurrent jobs must be at least 1"));
        }
        if self.max_consecutive_errors == 0 {
            return Err(Error::config("max consecutive errors must be at least 1"));
        }
        if self.backoff_cap < self.poll_interval {
            return Err(Error::config(format!(
                "backoff cap ({:?}) must not be smaller than the poll interval ({:?})",
                self.backoff_cap, self.poll_interval
            )));
        }
        if self.stale_check_every_n_polls == 0 {
            return Err(Error::config("stale check cadence must be at least 1"));
        }
        if self.drain_poll.is_zero() {
            return Err(Error::config("drain poll interval must be greater than zero"));
        }
        Ok(())
    }

    /// Number of idle cycles between "idle for Xs" summaries (roughly one per minute).
    pub fn idle_summary_interval(&self) -> u64 {
        let poll_ms = self.poll_interval.as_millis().max(1) as u64;
        (60_000 / poll_ms).max(1)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    pub fn with_max_consecutive_errors(mut self, max: u32) -> Self {
        self.max_consecutive_errors = max;
        self
    }

    pub fn with_backoff_cap(mut self, cap: Duration) -> Self {
        self.backoff_cap = cap;
        self
    }

    pub fn with_stale_job_max_age(mut self, age: Duration) -> Self {
        self.stale_job_max_age = age;
        self
    }

    pub fn with_stale_check_every_n_polls(mut self, n: u64) -> Self {
        self.stale_check_every_n_polls = n;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_drain_poll(mut self, poll: Duration) -> Self {
        self.drain_poll = poll;
        self
    }
}

/// Database connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
}

impl DatabaseConfig {
    /// Reads `DATABASE_URL`.
    pub fn from_env_or_default() -> Self {
        let url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        Self { url }
    }
}

/// Console and file logging settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingSettings {
    /// Filter directive used when `RUST_LOG` is not set.
    pub filter: Option<String>,
    /// Directory for daily-rolling log files; console only when `None`.
    pub log_dir: Option<PathBuf>,
    /// Emit JSON lines on the console instead of the human-readable format.
    pub json: bool,
}

impl LoggingSettings {
    /// Reads `LOG_FILTER`, `LOG_DIR` and `LOG_FORMAT`.
    pub fn from_env_or_default() -> Self {
        let filter = std::env::var("LOG_FILTER")
            .ok()
            .filter(|f| !f.trim().is_empty());
        let log_dir = std::env::var("LOG_DIR")
            .ok()
            .filter(|d| !d.trim().is_empty())
            .map(PathBuf::from);
        let json = std::env::var("LOG_FORMAT")
            .map(|f| f.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Self {
            filter,
            log_dir,
            json,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable configuration value");
            None
        }
    }
}
