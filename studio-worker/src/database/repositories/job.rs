//! SQLite-backed job queue.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::warn;

use crate::database::models::JobDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::{cutoff_ms, ms_to_datetime, now_ms};
use crate::queue::{Job, JobQueue, JobStatus, JobType, NewJob, STALE_JOB_ERROR};
use crate::{Error, Result};

/// Job queue over the `job` table.
///
/// Claims and reaps are single `UPDATE … RETURNING` statements. SQLite
/// serializes writers, so a row can only move out of `PENDING` once no
/// matter how many workers share the database file.
#[derive(Clone)]
pub struct SqlxJobQueue {
    pool: SqlitePool,
}

impl SqlxJobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_row(&self, id: &str) -> Result<Option<JobDbModel>> {
        let row = sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}

#[async_trait]
impl JobQueue for SqlxJobQueue {
    async fn claim_next_job(&self, job_type: JobType) -> Result<Option<Job>> {
        let row = retry_on_sqlite_busy("claim_next_job", || async {
            let now = now_ms();
            let row = sqlx::query_as::<_, JobDbModel>(
                r#"
                UPDATE job
                SET status = 'PROCESSING', started_at = ?, updated_at = ?
                WHERE id = (
                    SELECT id FROM job
                    WHERE status = 'PENDING' AND job_type = ?
                    ORDER BY created_at, rowid
                    LIMIT 1
                )
                AND status = 'PENDING'
                RETURNING *
                "#,
            )
            .bind(now)
            .bind(now)
            .bind(job_type.as_str())
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        })
        .await?;

        row.map(JobDbModel::into_job).transpose()
    }

    async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<Job> {
        let from = match status {
            JobStatus::Processing => JobStatus::Pending,
            JobStatus::Completed | JobStatus::Failed => JobStatus::Processing,
            JobStatus::Pending => {
                let current = self.get_job(id).await?;
                return Err(Error::invalid_transition(current.status, status));
            }
        };

        let (result_json, error) = match status {
            JobStatus::Completed => (
                Some(serde_json::to_string(&result.unwrap_or(Value::Null))?),
                None,
            ),
            JobStatus::Failed => (None, Some(error.unwrap_or_else(|| "Job failed".to_string()))),
            _ => (None, None),
        };

        let row = retry_on_sqlite_busy("update_job_status", || async {
            let now = now_ms();
            let started_at = (status == JobStatus::Processing).then_some(now);
            let completed_at = status.is_terminal().then_some(now);

            let row = sqlx::query_as::<_, JobDbModel>(
                r#"
                UPDATE job
                SET status = ?,
                    result = ?,
                    error = ?,
                    started_at = COALESCE(?, started_at),
                    completed_at = COALESCE(?, completed_at),
                    updated_at = ?
                WHERE id = ? AND status = ?
                RETURNING *
                "#,
            )
            .bind(status.as_str())
            .bind(&result_json)
            .bind(&error)
            .bind(started_at)
            .bind(completed_at)
            .bind(now)
            .bind(id)
            .bind(from.as_str())
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        })
        .await?;

        match row {
            Some(row) => row.into_job(),
            None => {
                let current = self.get_job(id).await?;
                Err(Error::invalid_transition(current.status, status))
            }
        }
    }

    async fn get_job(&self, id: &str) -> Result<Job> {
        self.fetch_row(id)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))?
            .into_job()
    }

    async fn fail_stale_jobs(&self, max_age: Duration) -> Result<Vec<Job>> {
        let rows = retry_on_sqlite_busy("fail_stale_jobs", || async {
            let now = now_ms();
            let rows = sqlx::query_as::<_, JobDbModel>(
                r#"
                UPDATE job
                SET status = 'FAILED',
                    error = ?,
                    result = NULL,
                    completed_at = ?,
                    updated_at = ?
                WHERE status = 'PROCESSING'
                AND COALESCE(started_at, updated_at) < ?
                RETURNING *
                "#,
            )
            .bind(STALE_JOB_ERROR)
            .bind(now)
            .bind(now)
            .bind(cutoff_ms(now, max_age))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        })
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let (id, job_type) = (row.id.clone(), row.job_type.clone());
            match row.into_reaped_job() {
                Ok(job) => jobs.push(job),
                // Only a type this build does not know gets here.
                Err(e) => warn!(
                    job_id = %id,
                    job_type = %job_type,
                    error = %e,
                    "Reaped job could not be decoded"
                ),
            }
        }
        Ok(jobs)
    }

    async fn find_active_job(
        &self,
        job_type: JobType,
        payload_key: &str,
        value: &str,
    ) -> Result<Option<Job>> {
        let path = format!("$.\"{payload_key}\"");
        let row = sqlx::query_as::<_, JobDbModel>(
            r#"
            SELECT * FROM job
            WHERE job_type = ?
            AND status IN ('PENDING', 'PROCESSING')
            AND CASE WHEN json_valid(payload) THEN json_extract(payload, ?) END = ?
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(job_type.as_str())
        .bind(path)
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobDbModel::into_job).transpose()
    }

    async fn enqueue(&self, job: NewJob) -> Result<Job> {
        let job = job.into_job(ms_to_datetime(now_ms()));
        let row = JobDbModel::from_job(&job)?;

        retry_on_sqlite_busy("enqueue", || async {
            sqlx::query(
                r#"
                INSERT INTO job (
                    id, job_type, status, payload, result, error, created_by,
                    created_at, updated_at, started_at, completed_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.id)
            .bind(&row.job_type)
            .bind(&row.status)
            .bind(&row.payload)
            .bind(&row.result)
            .bind(&row.error)
            .bind(&row.created_by)
            .bind(row.created_at)
            .bind(row.updated_at)
            .bind(row.started_at)
            .bind(row.completed_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;

        Ok(job)
    }
}
