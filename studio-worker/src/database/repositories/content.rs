//! SQLite-backed content store.

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::warn;

use crate::content::{ContentEntity, ContentStore, EntityRef, InProgressOperation};
use crate::database::models::ContentEntityDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Content store over the `content_entity` table.
#[derive(Clone)]
pub struct SqlxContentStore {
    pool: SqlitePool,
}

impl SqlxContentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, entity: &EntityRef) -> Result<ContentEntity> {
        sqlx::query_as::<_, ContentEntityDbModel>(
            "SELECT * FROM content_entity WHERE kind = ? AND id = ?",
        )
        .bind(entity.kind.to_string())
        .bind(&entity.id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found(entity.kind.to_string(), entity.id.clone()))?
        .into_entity()
    }

    /// Insert or replace an entity row.
    pub async fn upsert(&self, entity: &ContentEntity) -> Result<()> {
        let row = ContentEntityDbModel::from_entity(entity);
        sqlx::query(
            r#"
            INSERT INTO content_entity (
                id, kind, owner_id, status, error_message,
                external_operation_id, external_operation_status, job_id, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (kind, id) DO UPDATE SET
                owner_id = excluded.owner_id,
                status = excluded.status,
                error_message = excluded.error_message,
                external_operation_id = excluded.external_operation_id,
                external_operation_status = excluded.external_operation_status,
                job_id = excluded.job_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&row.id)
        .bind(&row.kind)
        .bind(&row.owner_id)
        .bind(&row.status)
        .bind(&row.error_message)
        .bind(&row.external_operation_id)
        .bind(&row.external_operation_status)
        .bind(&row.job_id)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn exists(&self, entity: &EntityRef) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM content_entity WHERE kind = ? AND id = ?")
                .bind(entity.kind.to_string())
                .bind(&entity.id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl ContentStore for SqlxContentStore {
    async fn mark_failed(&self, entity: &EntityRef, job_id: &str, error: &str) -> Result<bool> {
        let kind = entity.kind.to_string();
        let updated = retry_on_sqlite_busy("mark_entity_failed", || async {
            let result = sqlx::query(
                r#"
                UPDATE content_entity
                SET status = 'FAILED', error_message = ?, updated_at = ?
                WHERE kind = ? AND id = ? AND (job_id IS NULL OR job_id = ?)
                "#,
            )
            .bind(error)
            .bind(now_ms())
            .bind(&kind)
            .bind(&entity.id)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if updated > 0 {
            return Ok(true);
        }
        if self.exists(entity).await? {
            Ok(false)
        } else {
            Err(Error::not_found(kind, entity.id.clone()))
        }
    }

    async fn mark_processing(&self, entity: &EntityRef, job_id: &str) -> Result<()> {
        let kind = entity.kind.to_string();
        let updated = retry_on_sqlite_busy("mark_entity_processing", || async {
            let result = sqlx::query(
                r#"
                UPDATE content_entity
                SET status = 'PROCESSING', error_message = NULL, job_id = ?, updated_at = ?
                WHERE kind = ? AND id = ?
                "#,
            )
            .bind(job_id)
            .bind(now_ms())
            .bind(&kind)
            .bind(&entity.id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if updated == 0 {
            return Err(Error::not_found(kind, entity.id.clone()));
        }
        Ok(())
    }

    async fn list_in_progress_operations(&self) -> Result<Vec<InProgressOperation>> {
        let rows = sqlx::query_as::<_, ContentEntityDbModel>(
            r#"
            SELECT * FROM content_entity
            WHERE external_operation_status = 'IN_PROGRESS'
            AND external_operation_id IS NOT NULL
            ORDER BY updated_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut operations = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            match row.into_in_progress_operation() {
                Ok(Some(op)) => operations.push(op),
                Ok(None) => {}
                Err(e) => warn!(entity_id = %id, error = %e, "Skipping undecodable content row"),
            }
        }
        Ok(operations)
    }
}
