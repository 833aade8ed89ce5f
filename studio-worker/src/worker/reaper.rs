//! Stale job reaper.
//!
//! Fails jobs that have sat in processing past the maximum age, presuming
//! their worker died, and marks the entities they were producing as failed.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::content::{ContentStore, EntityStatus};
use crate::notification::{Notification, NotificationSink};
use crate::queue::{Job, JobQueue, JobType, STALE_JOB_ERROR};

/// Outcome of one reaper pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Jobs failed by this pass.
    pub reaped: Vec<(String, JobType)>,
    /// Entities marked failed.
    pub entities_failed: usize,
    /// Entities left alone because a newer job owns them.
    pub entities_superseded: usize,
    /// Entity updates or notifications that errored.
    pub errors: usize,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.reaped.is_empty()
    }
}

#[derive(Clone)]
pub struct StaleJobReaper {
    queue: Arc<dyn JobQueue>,
    content: Arc<dyn ContentStore>,
    notifier: Arc<dyn NotificationSink>,
    max_age: Duration,
}

impl StaleJobReaper {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        content: Arc<dyn ContentStore>,
        notifier: Arc<dyn NotificationSink>,
        max_age: Duration,
    ) -> Self {
        Self {
            queue,
            content,
            notifier,
            max_age,
        }
    }

    /// Run one pass. Never fails; errors are logged and left for the next pass.
    pub async fn reap(&self) -> ReapReport {
        let mut report = ReapReport::default();

        let jobs = match self.queue.fail_stale_jobs(self.max_age).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Stale job check failed");
                return report;
            }
        };

        if jobs.is_empty() {
            debug!("No stale jobs found");
            return report;
        }

        for job in &jobs {
            report.reaped.push((job.id.clone(), job.job_type));
            self.reconcile(job, &mut report).await;
        }

        let summary: Vec<String> = report
            .reaped
            .iter()
            .map(|(id, job_type)| format!("{id} ({job_type})"))
            .collect();
        warn!(
            count = report.reaped.len(),
            max_age_secs = self.max_age.as_secs(),
            jobs = %summary.join(", "),
            "Reaped stale jobs"
        );

        report
    }

    /// One entity update attempt and one notification per reaped job.
    async fn reconcile(&self, job: &Job, report: &mut ReapReport) {
        let error_message = job.error.as_deref().unwrap_or(STALE_JOB_ERROR);

        let notification = match job.entity_ref() {
            Some(entity) => match self.content.mark_failed(&entity, &job.id, error_message).await {
                Ok(true) => {
                    report.entities_failed += 1;
                    Notification::entity_changed(
                        job.user_id(),
                        &entity,
                        EntityStatus::Failed,
                        Some(error_message.to_string()),
                    )
                }
                Ok(false) => {
                    report.entities_superseded += 1;
                    info!(
                        job_id = %job.id,
                        entity = %entity,
                        "Entity already owned by a newer job, leaving it untouched"
                    );
                    Notification::job_resolved(job)
                }
                Err(e) => {
                    report.errors += 1;
                    warn!(
                        job_id = %job.id,
                        entity = %entity,
                        error = %e,
                        "Failed to mark entity of stale job as failed"
                    );
                    Notification::job_resolved(job)
                }
            },
            None => Notification::job_resolved(job),
        };

        if let Err(e) = self.notifier.publish(notification).await {
            report.errors += 1;
            warn!(job_id = %job.id, error = %e, "Failed to publish stale job notification");
        }
    }
}
