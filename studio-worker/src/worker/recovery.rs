//! Startup recovery of entities whose external operation outlived its job.
//!
//! Failing such an entity would throw away work an external provider may
//! still be doing. Instead a resuming job is enqueued; its handler picks up
//! the existing operation id and polls it to completion.

use chrono::{TimeDelta, Utc};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::content::{ContentStore, EntityKind, EntityStatus, InProgressOperation};
use crate::notification::{Notification, NotificationSink};
use crate::queue::{Job, JobQueue, JobStatus, JobType, NewJob};
use crate::{Error, Result};

/// Payload key carrying the external operation to resume.
pub const PAYLOAD_EXTERNAL_OPERATION_ID: &str = "externalOperationId";
/// Payload flag telling the handler to resume rather than start over.
pub const PAYLOAD_RESUME: &str = "resume";

/// Outcome of the recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Entities with an in-progress external operation.
    pub scanned: usize,
    /// Entities re-attached to a resuming job: (entity id, new job id).
    pub recovered: Vec<(String, String)>,
    /// Entities whose job is still alive.
    pub alive: usize,
    /// Entities skipped because of an error.
    pub errors: usize,
}

#[derive(Debug)]
enum Ownership {
    Alive,
    Orphaned(&'static str),
}

/// The job type that resumes work on an entity of `kind`.
fn resume_job_type(kind: EntityKind) -> JobType {
    match kind {
        EntityKind::Document => JobType::ProcessResearch,
        EntityKind::Podcast => JobType::GeneratePodcast,
        EntityKind::Voiceover => JobType::GenerateVoiceover,
        EntityKind::Infographic => JobType::GenerateInfographic,
    }
}

#[derive(Clone)]
pub struct OrphanRecovery {
    queue: Arc<dyn JobQueue>,
    content: Arc<dyn ContentStore>,
    notifier: Arc<dyn NotificationSink>,
    stale_after: Duration,
}

impl OrphanRecovery {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        content: Arc<dyn ContentStore>,
        notifier: Arc<dyn NotificationSink>,
        stale_after: Duration,
    ) -> Self {
        Self {
            queue,
            content,
            notifier,
            stale_after,
        }
    }

    /// Run the pass. Never fails; each entity is handled independently.
    pub async fn recover(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        let operations = match self.content.list_in_progress_operations().await {
            Ok(ops) => ops,
            Err(e) => {
                error!(error = %e, "Failed to list in-progress external operations");
                return report;
            }
        };
        report.scanned = operations.len();

        for op in &operations {
            let ownership = match self.ownership(op).await {
                Ok(ownership) => ownership,
                Err(e) => {
                    report.errors += 1;
                    warn!(
                        entity = %op.entity,
                        job_id = op.job_id.as_deref().unwrap_or_default(),
                        error = %e,
                        "Could not determine owning job, skipping"
                    );
                    continue;
                }
            };

            let reason = match ownership {
                Ownership::Alive => {
                    report.alive += 1;
                    continue;
                }
                Ownership::Orphaned(reason) => reason,
            };

            match self.resume(op).await {
                Ok(job) => {
                    info!(
                        entity = %op.entity,
                        operation_id = %op.external_operation_id,
                        reason,
                        new_job_id = %job.id,
                        "Recovered orphaned external operation"
                    );
                    report.recovered.push((op.entity.id.clone(), job.id));
                }
                Err(e) => {
                    report.errors += 1;
                    warn!(entity = %op.entity, error = %e, "Failed to recover orphaned entity");
                }
            }
        }

        if report.recovered.is_empty() {
            debug!(scanned = report.scanned, "No orphaned external operations");
        } else {
            info!(
                scanned = report.scanned,
                recovered = report.recovered.len(),
                errors = report.errors,
                "Orphan recovery finished"
            );
        }

        report
    }

    async fn ownership(&self, op: &InProgressOperation) -> Result<Ownership> {
        let Some(job_id) = op.job_id.as_deref() else {
            return Ok(Ownership::Orphaned("no owning job"));
        };

        let job = match self.queue.get_job(job_id).await {
            Ok(job) => job,
            Err(Error::NotFound { .. }) => return Ok(Ownership::Orphaned("owning job missing")),
            Err(e) => return Err(e),
        };

        Ok(self.classify(&job))
    }

    fn classify(&self, job: &Job) -> Ownership {
        match job.status {
            JobStatus::Pending => Ownership::Alive,
            JobStatus::Processing => {
                let limit = TimeDelta::from_std(self.stale_after).unwrap_or(TimeDelta::MAX);
                match job.processing_age(Utc::now()) {
                    Some(age) if age > limit => Ownership::Orphaned("owning job is stale"),
                    _ => Ownership::Alive,
                }
            }
            JobStatus::Completed | JobStatus::Failed => {
                Ownership::Orphaned("owning job already finished")
            }
        }
    }

    /// Attach the entity to a resuming job, enqueueing one unless an earlier
    /// pass already did and that job is still alive.
    async fn resume(&self, op: &InProgressOperation) -> Result<Job> {
        let job_type = resume_job_type(op.entity.kind);

        let job = match self.existing_resume_job(op, job_type).await? {
            Some(job) => {
                debug!(
                    entity = %op.entity,
                    job_id = %job.id,
                    "Reusing resume job from an earlier recovery pass"
                );
                job
            }
            None => {
                let payload = json!({
                    op.entity.kind.payload_key(): op.entity.id,
                    PAYLOAD_EXTERNAL_OPERATION_ID: op.external_operation_id,
                    PAYLOAD_RESUME: true,
                });
                self.queue
                    .enqueue(NewJob::new(job_type, op.owner_id.clone(), payload))
                    .await?
            }
        };

        self.content.mark_processing(&op.entity, &job.id).await?;

        let notification =
            Notification::entity_changed(&op.owner_id, &op.entity, EntityStatus::Processing, None);
        if let Err(e) = self.notifier.publish(notification).await {
            warn!(entity = %op.entity, error = %e, "Failed to publish recovery notification");
        }

        Ok(job)
    }

    /// A live job resuming the same operation on the same entity, left behind
    /// when a previous pass enqueued it but never re-pointed the entity.
    async fn existing_resume_job(
        &self,
        op: &InProgressOperation,
        job_type: JobType,
    ) -> Result<Option<Job>> {
        let Some(job) = self
            .queue
            .find_active_job(job_type, PAYLOAD_EXTERNAL_OPERATION_ID, &op.external_operation_id)
            .await?
        else {
            return Ok(None);
        };

        let same_entity = job
            .payload
            .get(op.entity.kind.payload_key())
            .and_then(Value::as_str)
            == Some(op.entity.id.as_str());
        let resuming = job.payload.get(PAYLOAD_RESUME).and_then(Value::as_bool) == Some(true);
        let alive = matches!(self.classify(&job), Ownership::Alive);

        Ok((same_entity && resuming && alive).then_some(job))
    }
}
