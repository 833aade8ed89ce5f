//! Content entity row model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::content::{
    ContentEntity, EntityKind, EntityRef, EntityStatus, InProgressOperation, OperationStatus,
};
use crate::database::time::{datetime_to_ms, ms_to_datetime};
use crate::{Error, Result};

/// Row of the `content_entity` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ContentEntityDbModel {
    pub id: String,
    /// DOCUMENT, PODCAST, VOICEOVER, INFOGRAPHIC
    pub kind: String,
    pub owner_id: String,
    /// PENDING, PROCESSING, READY, FAILED
    pub status: String,
    pub error_message: Option<String>,
    pub external_operation_id: Option<String>,
    /// IN_PROGRESS, COMPLETED, FAILED
    pub external_operation_status: Option<String>,
    pub job_id: Option<String>,
    pub updated_at: i64,
}

fn parse_column<T: std::str::FromStr>(column: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Other(format!("Invalid {column} '{value}'")))
}

impl ContentEntityDbModel {
    pub fn from_entity(entity: &ContentEntity) -> Self {
        Self {
            id: entity.entity.id.clone(),
            kind: entity.entity.kind.to_string(),
            owner_id: entity.owner_id.clone(),
            status: entity.status.to_string(),
            error_message: entity.error_message.clone(),
            external_operation_id: entity.external_operation_id.clone(),
            external_operation_status: entity.external_operation_status.map(|s| s.to_string()),
            job_id: entity.job_id.clone(),
            updated_at: datetime_to_ms(entity.updated_at),
        }
    }

    pub fn entity_ref(&self) -> Result<EntityRef> {
        let kind: EntityKind = parse_column("entity kind", &self.kind)?;
        Ok(EntityRef::new(kind, self.id.clone()))
    }

    pub fn into_entity(self) -> Result<ContentEntity> {
        let entity = self.entity_ref()?;
        let status: EntityStatus = parse_column("entity status", &self.status)?;
        let external_operation_status = self
            .external_operation_status
            .as_deref()
            .map(|s| parse_column::<OperationStatus>("operation status", s))
            .transpose()?;

        Ok(ContentEntity {
            entity,
            owner_id: self.owner_id,
            status,
            error_message: self.error_message,
            external_operation_id: self.external_operation_id,
            external_operation_status,
            job_id: self.job_id,
            updated_at: ms_to_datetime(self.updated_at),
        })
    }

    /// `None` when the row carries no external operation id.
    pub fn into_in_progress_operation(self) -> Result<Option<InProgressOperation>> {
        let entity = self.entity_ref()?;
        Ok(self
            .external_operation_id
            .map(|external_operation_id| InProgressOperation {
                entity,
                owner_id: self.owner_id,
                external_operation_id,
                job_id: self.job_id,
            }))
    }
}
