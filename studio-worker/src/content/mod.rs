//! Domain entities produced by jobs (documents, podcasts, voiceovers,
//! infographics) and the narrow store interface the engine reconciles them
//! through.

mod memory;

pub use memory::MemoryContentStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Result;

/// Kind of content entity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Document,
    Podcast,
    Voiceover,
    Infographic,
}

impl EntityKind {
    /// Job payload key holding the id of an entity of this kind.
    pub fn payload_key(&self) -> &'static str {
        match self {
            Self::Document => "documentId",
            Self::Podcast => "podcastId",
            Self::Voiceover => "voiceoverId",
            Self::Infographic => "infographicId",
        }
    }
}

/// Entity generation status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

/// Status of a long-running operation placed with an external provider.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    InProgress,
    Completed,
    Failed,
}

/// Typed reference to one content entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// A content entity as the engine sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentEntity {
    pub entity: EntityRef,
    pub owner_id: String,
    pub status: EntityStatus,
    pub error_message: Option<String>,
    pub external_operation_id: Option<String>,
    pub external_operation_status: Option<OperationStatus>,
    /// The job currently responsible for this entity.
    pub job_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ContentEntity {
    pub fn new(entity: EntityRef, owner_id: impl Into<String>) -> Self {
        Self {
            entity,
            owner_id: owner_id.into(),
            status: EntityStatus::Pending,
            error_message: None,
            external_operation_id: None,
            external_operation_status: None,
            job_id: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self.status = EntityStatus::Processing;
        self
    }

    pub fn with_external_operation(
        mut self,
        operation_id: impl Into<String>,
        status: OperationStatus,
    ) -> Self {
        self.external_operation_id = Some(operation_id.into());
        self.external_operation_status = Some(status);
        self
    }
}

/// An entity whose external operation is still marked in progress.
#[derive(Debug, Clone, PartialEq)]
pub struct InProgressOperation {
    pub entity: EntityRef,
    pub owner_id: String,
    pub external_operation_id: String,
    pub job_id: Option<String>,
}

/// Domain store the reaper and orphan recovery write through.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Mark the entity failed with `error`.
    ///
    /// Returns `false` without touching the entity when a different job now
    /// owns it, so a reaped job never clobbers its successor's progress.
    async fn mark_failed(&self, entity: &EntityRef, job_id: &str, error: &str) -> Result<bool>;

    /// Reset the entity to processing under `job_id`, clearing any error.
    async fn mark_processing(&self, entity: &EntityRef, job_id: &str) -> Result<()>;

    /// Entities whose external operation is still in progress.
    async fn list_in_progress_operations(&self) -> Result<Vec<InProgressOperation>>;
}
