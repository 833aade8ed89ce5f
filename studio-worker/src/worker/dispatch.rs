//! Runs one claimed job to resolution.

use serde_json::Value;
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use super::handler::HandlerRegistry;
use super::limiter::ActiveJobGuard;
use super::state::RunState;
use crate::notification::{Notification, NotificationSink};
use crate::queue::{Job, JobQueue, JobStatus};

/// Invoked with every job the engine resolves, after its status persisted.
pub type CompletionCallback = Arc<dyn Fn(&Job) + Send + Sync>;

/// Spawns claimed jobs and carries each through
/// handler → status update → notification → slot release.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    queue: Arc<dyn JobQueue>,
    notifier: Arc<dyn NotificationSink>,
    handlers: Arc<HandlerRegistry>,
    on_complete: Option<CompletionCallback>,
    run: Arc<RunState>,
}

impl Dispatcher {
    pub(crate) fn new(
        queue: Arc<dyn JobQueue>,
        notifier: Arc<dyn NotificationSink>,
        handlers: Arc<HandlerRegistry>,
        on_complete: Option<CompletionCallback>,
        run: Arc<RunState>,
    ) -> Self {
        Self {
            queue,
            notifier,
            handlers,
            on_complete,
            run,
        }
    }

    /// Fire and forget: the caller only observes the job through the limiter
    /// and the notification sink.
    pub(crate) fn dispatch(&self, job: Job, slot: ActiveJobGuard) -> JoinHandle<()> {
        self.run.record_dispatch();
        let this = self.clone();
        tokio::spawn(async move { this.resolve(job, slot).await })
    }

    async fn resolve(self, job: Job, slot: ActiveJobGuard) {
        let started = std::time::Instant::now();
        debug!(job_id = %job.id, job_type = %job.job_type, "Executing job");

        let (status, result, error) = match self.execute(&job).await {
            Ok(value) => (JobStatus::Completed, Some(value), None),
            Err(message) => (JobStatus::Failed, None, Some(message)),
        };

        match self
            .queue
            .update_job_status(&job.id, status, result, error)
            .await
        {
            Ok(resolved) => {
                match resolved.status {
                    JobStatus::Completed => info!(
                        job_id = %resolved.id,
                        job_type = %resolved.job_type,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Job completed"
                    ),
                    _ => warn!(
                        job_id = %resolved.id,
                        job_type = %resolved.job_type,
                        error = resolved.error.as_deref().unwrap_or_default(),
                        "Job failed"
                    ),
                }
                self.notify(&resolved).await;
            }
            // The job stays processing until the stale job reaper picks it up.
            Err(e) => error!(
                job_id = %job.id,
                job_type = %job.job_type,
                target_status = %status,
                error = %e,
                "Failed to record job outcome"
            ),
        }

        self.run.record_resolution();
        drop(slot);
    }

    /// Run the registered handler on its own task so a panic surfaces as a
    /// failed job instead of tearing down the dispatcher.
    async fn execute(&self, job: &Job) -> Result<Value, String> {
        let Some(handler) = self.handlers.get(job.job_type) else {
            return Err(format!("no handler registered for job type {}", job.job_type));
        };

        let owned = job.clone();
        let outcome = tokio::spawn(async move { handler.handle(&owned).await }).await;

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(join_err) => Err(describe_join_error(join_err)),
        }
    }

    async fn notify(&self, job: &Job) {
        if let Err(e) = self.notifier.publish(Notification::job_resolved(job)).await {
            warn!(job_id = %job.id, error = %e, "Failed to publish job notification");
        }
        if let Some(callback) = &self.on_complete {
            callback(job);
        }
    }
}

fn describe_join_error(err: JoinError) -> String {
    if !err.is_panic() {
        return "job handler was cancelled".to_string();
    }

    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("job handler panicked: {}", message)
}
