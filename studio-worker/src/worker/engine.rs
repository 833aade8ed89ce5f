//! Worker lifecycle: start, supervised polling, stop with bounded drain.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatch::{CompletionCallback, Dispatcher};
use super::handler::HandlerRegistry;
use super::limiter::ConcurrencyLimiter;
use super::reaper::{ReapReport, StaleJobReaper};
use super::recovery::{OrphanRecovery, RecoveryReport};
use super::scheduler::PollLoop;
use super::state::{RunState, WorkerState, WorkerStats};
use super::supervisor::supervise;
use crate::config::WorkerConfig;
use crate::content::ContentStore;
use crate::notification::{BroadcastNotifier, NotificationSink};
use crate::queue::JobQueue;
use crate::{Error, Result};

/// How the supervised poll loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LoopExit {
    Shutdown,
    Exhausted { attempts: u32, last_error: String },
    Crashed(String),
}

impl LoopExit {
    fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::Shutdown,
            Err(Error::PollLoopExhausted {
                attempts,
                last_error,
            }) => Self::Exhausted {
                attempts,
                last_error,
            },
            Err(e) => Self::Crashed(e.to_string()),
        }
    }

    fn into_result(self) -> Result<()> {
        match self {
            Self::Shutdown => Ok(()),
            Self::Exhausted {
                attempts,
                last_error,
            } => Err(Error::PollLoopExhausted {
                attempts,
                last_error,
            }),
            Self::Crashed(msg) => Err(Error::Other(msg)),
        }
    }
}

/// Result of [`Worker::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Every in-flight job finished before the timeout.
    pub drained: bool,
    /// Jobs still running when the drain ended.
    pub remaining_jobs: usize,
    pub elapsed: Duration,
}

pub struct WorkerBuilder {
    queue: Arc<dyn JobQueue>,
    content: Arc<dyn ContentStore>,
    notifier: Option<Arc<dyn NotificationSink>>,
    handlers: HandlerRegistry,
    config: WorkerConfig,
    on_complete: Option<CompletionCallback>,
}

impl WorkerBuilder {
    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Defaults to a [`BroadcastNotifier`] nobody listens to.
    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Called with every job the engine resolves, after its status persisted.
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&crate::queue::Job) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Result<Worker> {
        self.config.validate()?;
        if self.handlers.is_empty() {
            warn!("No job handlers registered; the worker will never claim jobs");
        }

        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(BroadcastNotifier::new()));
        let run = Arc::new(RunState::new());
        let limiter = ConcurrencyLimiter::new(self.config.max_concurrent_jobs);
        let handlers = Arc::new(self.handlers);
        let shutdown = CancellationToken::new();

        let reaper = StaleJobReaper::new(
            self.queue.clone(),
            self.content.clone(),
            notifier.clone(),
            self.config.stale_job_max_age,
        );
        let recovery = OrphanRecovery::new(
            self.queue.clone(),
            self.content.clone(),
            notifier.clone(),
            self.config.stale_job_max_age,
        );
        let poll_loop = PollLoop {
            queue: self.queue.clone(),
            dispatcher: Dispatcher::new(
                self.queue,
                notifier,
                handlers.clone(),
                self.on_complete,
                run.clone(),
            ),
            limiter: limiter.clone(),
            reaper: reaper.clone(),
            job_types: handlers.job_types(),
            config: self.config.clone(),
            run: run.clone(),
            shutdown: shutdown.clone(),
        };

        let (state, _) = watch::channel(WorkerState::Idle);
        let (exit, _) = watch::channel(None);

        Ok(Worker {
            inner: Arc::new(Inner {
                config: self.config,
                poll_loop: Arc::new(poll_loop),
                reaper,
                recovery,
                limiter,
                run,
                shutdown,
                state,
                exit,
            }),
        })
    }
}

struct Inner {
    config: WorkerConfig,
    poll_loop: Arc<PollLoop>,
    reaper: StaleJobReaper,
    recovery: OrphanRecovery,
    limiter: Arc<ConcurrencyLimiter>,
    run: Arc<RunState>,
    shutdown: CancellationToken,
    state: watch::Sender<WorkerState>,
    exit: watch::Sender<Option<LoopExit>>,
}

/// The background job worker engine.
///
/// Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<Inner>,
}

impl Worker {
    pub fn builder(queue: Arc<dyn JobQueue>, content: Arc<dyn ContentStore>) -> WorkerBuilder {
        WorkerBuilder {
            queue,
            content,
            notifier: None,
            handlers: HandlerRegistry::new(),
            config: WorkerConfig::default(),
            on_complete: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.inner.state.borrow()
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats::capture(self.state(), self.inner.limiter.active(), &self.inner.run)
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    /// Run orphan recovery, one stale job pass, then begin polling.
    ///
    /// Only the first call does anything.
    pub async fn start(&self) {
        let claimed = self.inner.state.send_if_modified(|state| {
            if *state == WorkerState::Idle {
                *state = WorkerState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            debug!(state = %self.state(), "Worker already started");
            return;
        }

        info!(
            poll_interval_ms = self.inner.config.poll_interval.as_millis() as u64,
            max_concurrent_jobs = self.inner.config.max_concurrent_jobs,
            job_types = ?self.inner.poll_loop.job_types,
            "Starting worker"
        );

        let recovery = self.recover_orphans().await;
        let reaped = self.reap_stale_jobs().await;
        debug!(
            recovered = recovery.recovered.len(),
            reaped = reaped.reaped.len(),
            "Startup reconciliation finished"
        );

        self.spawn_poll_loop();

        self.inner.state.send_if_modified(|state| {
            if *state == WorkerState::Starting {
                *state = WorkerState::Running;
                true
            } else {
                false
            }
        });
    }

    pub async fn recover_orphans(&self) -> RecoveryReport {
        self.inner.recovery.recover().await
    }

    pub async fn reap_stale_jobs(&self) -> ReapReport {
        self.inner.reaper.reap().await
    }

    fn spawn_poll_loop(&self) {
        let inner = self.inner.clone();
        let poll_loop = inner.poll_loop.clone();

        tokio::spawn(async move {
            // Inner task so a panic in the loop is observed instead of lost.
            let outcome =
                tokio::spawn(async move { supervise(&poll_loop).await }).await;

            let loop_exit = match outcome {
                Ok(result) => LoopExit::from_result(result),
                Err(e) => {
                    error!(error = %e, "Poll loop task crashed");
                    LoopExit::Crashed(format!("poll loop task crashed: {}", e))
                }
            };
            inner.exit.send_replace(Some(loop_exit));
        });
    }

    /// Resolves when the poll loop ends: `Ok` after a stop, `Err` when the
    /// supervisor gave up.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.inner.exit.subscribe();
        let exit = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Other("worker dropped before the poll loop ended".to_string()))?
            .as_ref()
            .cloned();
        exit.map_or(Ok(()), LoopExit::into_result)
    }

    /// Stop claiming, then wait up to the drain timeout for in-flight jobs.
    ///
    /// Idempotent: later calls wait for the first stop to finish.
    pub async fn stop(&self) -> DrainReport {
        let started = Instant::now();
        let mut previous = WorkerState::Idle;
        self.inner.state.send_modify(|state| {
            previous = *state;
            *state = match *state {
                WorkerState::Idle => WorkerState::Stopped,
                WorkerState::Starting | WorkerState::Running => WorkerState::Stopping,
                other => other,
            };
        });

        match previous {
            WorkerState::Idle => {
                self.inner.shutdown.cancel();
                self.inner.exit.send_replace(Some(LoopExit::Shutdown));
                return self.report(started);
            }
            WorkerState::Starting | WorkerState::Running => {}
            _ => {
                let mut rx = self.inner.state.subscribe();
                let _ = rx.wait_for(|s| *s == WorkerState::Stopped).await;
                return self.report(started);
            }
        }

        info!(active_jobs = self.inner.limiter.active(), "Stopping worker");
        self.inner.shutdown.cancel();

        let deadline = started + self.inner.config.drain_timeout;

        // The loop may be mid-claim; let it finish so nothing is dispatched
        // after the drain below has counted.
        let mut exit = self.inner.exit.subscribe();
        let loop_timed_out =
            tokio::time::timeout_at(deadline.into(), exit.wait_for(Option::is_some))
                .await
                .is_err();
        if loop_timed_out {
            warn!("Poll loop did not exit before the drain deadline");
        }

        let drained = self.drain(deadline).await;

        self.inner.state.send_replace(WorkerState::Drained);
        let report = self.report(started);
        self.inner.state.send_replace(WorkerState::Stopped);

        if drained {
            info!(elapsed_ms = report.elapsed.as_millis() as u64, "Worker stopped");
        } else {
            warn!(
                remaining_jobs = report.remaining_jobs,
                timeout_ms = self.inner.config.drain_timeout.as_millis() as u64,
                "Drain timeout reached with jobs still running"
            );
        }
        report
    }

    async fn drain(&self, deadline: Instant) -> bool {
        loop {
            let active = self.inner.limiter.active();
            if active == 0 {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            info!(
                active_jobs = active,
                remaining_ms = (deadline - now).as_millis() as u64,
                "Waiting for in-flight jobs to finish"
            );
            let nap = self.inner.config.drain_poll.min(deadline - now);
            tokio::time::sleep(nap).await;
        }
    }

    fn report(&self, started: Instant) -> DrainReport {
        let remaining_jobs = self.inner.limiter.active();
        DrainReport {
            drained: remaining_jobs == 0,
            remaining_jobs,
            elapsed: started.elapsed(),
        }
    }
}
