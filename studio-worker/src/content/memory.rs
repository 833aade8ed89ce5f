//! In-process content store.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use super::{
    ContentEntity, ContentStore, EntityRef, EntityStatus, InProgressOperation, OperationStatus,
};
use crate::{Error, Result};

/// Content store backed by a concurrent map; used by tests and embedders
/// without a database.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    entities: DashMap<EntityRef, ContentEntity>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entity: ContentEntity) {
        self.entities.insert(entity.entity.clone(), entity);
    }

    pub fn get(&self, entity: &EntityRef) -> Option<ContentEntity> {
        self.entities.get(entity).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn mark_failed(&self, entity: &EntityRef, job_id: &str, error: &str) -> Result<bool> {
        let mut row = self
            .entities
            .get_mut(entity)
            .ok_or_else(|| Error::not_found(entity.kind.to_string(), entity.id.clone()))?;

        if row.job_id.as_deref().is_some_and(|owner| owner != job_id) {
            return Ok(false);
        }

        row.status = EntityStatus::Failed;
        row.error_message = Some(error.to_string());
        row.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_processing(&self, entity: &EntityRef, job_id: &str) -> Result<()> {
        let mut row = self
            .entities
            .get_mut(entity)
            .ok_or_else(|| Error::not_found(entity.kind.to_string(), entity.id.clone()))?;

        row.status = EntityStatus::Processing;
        row.error_message = None;
        row.job_id = Some(job_id.to_string());
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn list_in_progress_operations(&self) -> Result<Vec<InProgressOperation>> {
        let mut found: Vec<InProgressOperation> = self
            .entities
            .iter()
            .filter(|e| e.external_operation_status == Some(OperationStatus::InProgress))
            .filter_map(|e| {
                let operation_id = e.external_operation_id.clone()?;
                Some(InProgressOperation {
                    entity: e.entity.clone(),
                    owner_id: e.owner_id.clone(),
                    external_operation_id: operation_id,
                    job_id: e.job_id.clone(),
                })
            })
            .collect();
        found.sort_by(|a, b| a.entity.id.cmp(&b.entity.id));
        Ok(found)
    }
}
