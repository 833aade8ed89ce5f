//! The poll loop.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::dispatch::Dispatcher;
use super::limiter::ConcurrencyLimiter;
use super::reaper::StaleJobReaper;
use super::state::RunState;
use crate::Result;
use crate::config::WorkerConfig;
use crate::queue::{JobQueue, JobType};

/// What one poll cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No spare capacity; nothing was attempted.
    AtCapacity,
    /// Claimed and dispatched this many jobs (possibly zero).
    Claimed(usize),
}

pub(crate) struct PollLoop {
    pub(crate) queue: Arc<dyn JobQueue>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) limiter: Arc<ConcurrencyLimiter>,
    pub(crate) reaper: StaleJobReaper,
    pub(crate) job_types: Vec<JobType>,
    pub(crate) config: WorkerConfig,
    pub(crate) run: Arc<RunState>,
    pub(crate) shutdown: CancellationToken,
}

impl PollLoop {
    /// Poll until shutdown. Returns `Err` only for loop-level faults.
    pub(crate) async fn run(&self) -> Result<()> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            self.poll_once().await?;
            self.run.clear_faults();

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Poll loop received shutdown signal");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// One cycle: periodic reap, then claim across job types in fixed order
    /// until capacity runs out.
    pub(crate) async fn poll_once(&self) -> Result<CycleOutcome> {
        let poll_count = self.run.next_poll();

        if poll_count % self.config.stale_check_every_n_polls == 0 {
            self.reaper.reap().await;
        }

        let capacity = self.limiter.spare_capacity();
        if capacity == 0 {
            debug!(
                active = self.limiter.active(),
                max = self.limiter.max(),
                "At capacity, skipping poll cycle"
            );
            return Ok(CycleOutcome::AtCapacity);
        }

        let mut claimed = 0usize;
        'types: for &job_type in &self.job_types {
            loop {
                if self.shutdown.is_cancelled() {
                    break 'types;
                }
                let Some(slot) = self.limiter.try_acquire() else {
                    break 'types;
                };

                match self.queue.claim_next_job(job_type).await {
                    Ok(Some(job)) => {
                        debug!(job_id = %job.id, job_type = %job_type, "Claimed job");
                        claimed += 1;
                        self.dispatcher.dispatch(job, slot);
                    }
                    Ok(None) => break,
                    Err(e) if e.is_loop_fault() => return Err(e),
                    Err(e) => {
                        warn!(job_type = %job_type, error = %e, "Failed to claim job, skipping type this cycle");
                        break;
                    }
                }
            }
        }

        if claimed == 0 {
            self.log_idle();
        } else {
            trace!(claimed, active = self.limiter.active(), "Poll cycle dispatched jobs");
        }

        Ok(CycleOutcome::Claimed(claimed))
    }

    fn log_idle(&self) {
        let idle = self.run.record_idle();
        let every = self.config.idle_summary_interval();
        if idle % every == 0 {
            let idle_for = idle_duration(self.config.poll_interval, idle);
            info!(
                idle_cycles = idle,
                "Worker idle for {}s, no pending jobs",
                idle_for.as_secs()
            );
        } else {
            debug!(idle_cycles = idle, "No jobs claimed this cycle");
        }
    }
}

fn idle_duration(poll_interval: Duration, cycles: u64) -> Duration {
    poll_interval.saturating_mul(u32::try_from(cycles).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MemoryContentStore;
    use crate::notification::BroadcastNotifier;
    use crate::queue::{JobStatus, MemoryJobQueue, NewJob};
    use crate::worker::handler::HandlerRegistry;
    use serde_json::{Value, json};
    use tokio::sync::Notify;

    fn poll_loop(
        queue: Arc<MemoryJobQueue>,
        handlers: HandlerRegistry,
        config: WorkerConfig,
    ) -> PollLoop {
        let notifier = Arc::new(BroadcastNotifier::new());
        let run = Arc::new(RunState::new());
        let job_types = handlers.job_types();
        PollLoop {
            queue: queue.clone(),
            dispatcher: Dispatcher::new(
                queue.clone(),
                notifier.clone(),
                Arc::new(handlers),
                None,
                run.clone(),
            ),
            limiter: ConcurrencyLimiter::new(config.max_concurrent_jobs),
            reaper: StaleJobReaper::new(
                queue,
                Arc::new(MemoryContentStore::new()),
                notifier,
                config.stale_job_max_age,
            ),
            job_types,
            config,
            run,
            shutdown: CancellationToken::new(),
        }
    }

    fn blocking_handlers(release: Arc<Notify>, types: &[JobType]) -> HandlerRegistry {
        let mut handlers = HandlerRegistry::new();
        for &job_type in types {
            let release = release.clone();
            handlers.register_fn(job_type, move |_| {
                let release = release.clone();
                async move {
                    release.notified().await;
                    Ok(Value::Null)
                }
            });
        }
        handlers
    }

    async fn enqueue(queue: &MemoryJobQueue, job_type: JobType, n: usize) {
        for _ in 0..n {
            queue
                .enqueue(NewJob::new(job_type, "user-1", json!({})))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_cycle_claims_up_to_capacity() {
        let queue = Arc::new(MemoryJobQueue::new());
        enqueue(&queue, JobType::ProcessUrl, 3).await;
        let release = Arc::new(Notify::new());
        let config = WorkerConfig::default().with_max_concurrent_jobs(2);
        let poll = poll_loop(
            queue.clone(),
            blocking_handlers(release.clone(), &[JobType::ProcessUrl]),
            config,
        );

        assert_eq!(poll.poll_once().await.unwrap(), CycleOutcome::Claimed(2));
        assert_eq!(poll.limiter.active(), 2);
        assert_eq!(queue.count_by_status(JobStatus::Pending), 1);
        assert_eq!(queue.count_by_status(JobStatus::Processing), 2);

        assert_eq!(poll.poll_once().await.unwrap(), CycleOutcome::AtCapacity);
        assert_eq!(queue.count_by_status(JobStatus::Pending), 1);

        release.notify_waiters();
    }

    #[tokio::test]
    async fn test_types_polled_in_fixed_order() {
        let queue = Arc::new(MemoryJobQueue::new());
        enqueue(&queue, JobType::ProcessResearch, 2).await;
        enqueue(&queue, JobType::GeneratePodcast, 2).await;
        let release = Arc::new(Notify::new());
        let config = WorkerConfig::default().with_max_concurrent_jobs(3);
        let poll = poll_loop(
            queue.clone(),
            blocking_handlers(
                release.clone(),
                &[JobType::ProcessResearch, JobType::GeneratePodcast],
            ),
            config,
        );

        poll.poll_once().await.unwrap();

        let processing: Vec<JobType> = queue
            .jobs()
            .into_iter()
            .filter(|j| j.status == JobStatus::Processing)
            .map(|j| j.job_type)
            .collect();
        let podcasts = processing
            .iter()
            .filter(|t| **t == JobType::GeneratePodcast)
            .count();
        assert_eq!(processing.len(), 3);
        assert_eq!(podcasts, 2);

        release.notify_waiters();
    }

    #[tokio::test]
    async fn test_idle_cycles_are_counted_and_reset() {
        let queue = Arc::new(MemoryJobQueue::new());
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn(JobType::ProcessUrl, |_| async { Ok(Value::Null) });
        let poll = poll_loop(queue.clone(), handlers, WorkerConfig::default());

        poll.poll_once().await.unwrap();
        poll.poll_once().await.unwrap();
        assert_eq!(
            poll.run.idle_count.load(std::sync::atomic::Ordering::Relaxed),
            2
        );

        enqueue(&queue, JobType::ProcessUrl, 1).await;
        assert_eq!(poll.poll_once().await.unwrap(), CycleOutcome::Claimed(1));
        assert_eq!(
            poll.run.idle_count.load(std::sync::atomic::Ordering::Relaxed),
            0
        );
    }

    #[tokio::test]
    async fn test_run_returns_on_shutdown() {
        let queue = Arc::new(MemoryJobQueue::new());
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn(JobType::ProcessUrl, |_| async { Ok(Value::Null) });
        let poll = poll_loop(
            queue,
            handlers,
            WorkerConfig::default().with_poll_interval(Duration::from_secs(3600)),
        );

        let shutdown = poll.shutdown.clone();
        let task = tokio::spawn(async move { poll.run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_reaper_runs_every_n_polls() {
        let queue = Arc::new(MemoryJobQueue::new());
        let started = chrono::Utc::now() - chrono::TimeDelta::hours(1);
        let mut stuck = NewJob::new(JobType::ProcessUrl, "user-1", json!({})).into_job(started);
        stuck
            .transition(JobStatus::Processing, None, None, started)
            .unwrap();
        queue.insert(stuck);

        let mut handlers = HandlerRegistry::new();
        handlers.register_fn(JobType::GenerateScript, |_| async { Ok(Value::Null) });
        let poll = poll_loop(
            queue.clone(),
            handlers,
            WorkerConfig::default().with_stale_check_every_n_polls(3),
        );

        poll.poll_once().await.unwrap();
        poll.poll_once().await.unwrap();
        assert_eq!(queue.count_by_status(JobStatus::Processing), 1);
        assert_eq!(queue.count_by_status(JobStatus::Failed), 0);

        poll.poll_once().await.unwrap();
        assert_eq!(queue.count_by_status(JobStatus::Processing), 0);
        assert_eq!(queue.count_by_status(JobStatus::Failed), 1);
    }

    #[test]
    fn test_idle_duration() {
        assert_eq!(
            idle_duration(Duration::from_secs(3), 20),
            Duration::from_secs(60)
        );
    }
}
