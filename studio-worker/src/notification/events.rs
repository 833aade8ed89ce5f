//! Events the worker emits toward users' live connections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::{EntityKind, EntityRef, EntityStatus};
use crate::queue::{Job, JobStatus, JobType};

/// A job reached a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub entity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobEvent {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type,
            status: job.status,
            entity_id: job.entity_ref().map(|e| e.id),
            error: job.error.clone(),
        }
    }
}

/// A content entity changed status outside the normal job flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityChangeEvent {
    pub kind: EntityKind,
    pub entity_id: String,
    pub status: EntityStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EntityChangeEvent {
    pub fn new(entity: &EntityRef, status: EntityStatus, error: Option<String>) -> Self {
        Self {
            kind: entity.kind,
            entity_id: entity.id.clone(),
            status,
            error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WorkerEvent {
    JobResolved(JobEvent),
    EntityChanged(EntityChangeEvent),
}

impl WorkerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::JobResolved(_) => "job_resolved",
            Self::EntityChanged(_) => "entity_changed",
        }
    }
}

/// An event addressed to one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub user_id: String,
    pub event: WorkerEvent,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(user_id: impl Into<String>, event: WorkerEvent) -> Self {
        Self {
            user_id: user_id.into(),
            event,
            timestamp: Utc::now(),
        }
    }

    pub fn job_resolved(job: &Job) -> Self {
        Self::new(job.user_id(), WorkerEvent::JobResolved(JobEvent::from_job(job)))
    }

    pub fn entity_changed(
        user_id: impl Into<String>,
        entity: &EntityRef,
        status: EntityStatus,
        error: Option<String>,
    ) -> Self {
        Self::new(
            user_id,
            WorkerEvent::EntityChanged(EntityChangeEvent::new(entity, status, error)),
        )
    }
}
