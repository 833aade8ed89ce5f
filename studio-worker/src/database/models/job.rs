//! Job row model.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use tracing::warn;

use crate::database::time::{datetime_to_ms, ms_to_datetime};
use crate::queue::{Job, JobStatus, JobType};
use crate::{Error, Result};

/// Row of the `job` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    /// Kebab-case job type tag, e.g. `process-url`.
    pub job_type: String,
    /// Status: PENDING, PROCESSING, COMPLETED, FAILED
    pub status: String,
    /// JSON object
    pub payload: String,
    /// JSON value, set once completed
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_by: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl JobDbModel {
    pub fn from_job(job: &Job) -> Result<Self> {
        Ok(Self {
            id: job.id.clone(),
            job_type: job.job_type.as_str().to_string(),
            status: job.status.as_str().to_string(),
            payload: serde_json::to_string(&job.payload)?,
            result: job.result.as_ref().map(serde_json::to_string).transpose()?,
            error: job.error.clone(),
            created_by: job.created_by.clone(),
            created_at: datetime_to_ms(job.created_at),
            updated_at: datetime_to_ms(job.updated_at),
            started_at: job.started_at.map(datetime_to_ms),
            completed_at: job.completed_at.map(datetime_to_ms),
        })
    }

    pub fn into_job(self) -> Result<Job> {
        let job_type = JobType::parse(&self.job_type).ok_or_else(|| {
            Error::Other(format!("Job {} has unknown type '{}'", self.id, self.job_type))
        })?;
        let status = JobStatus::parse(&self.status).ok_or_else(|| {
            Error::Other(format!("Job {} has unknown status '{}'", self.id, self.status))
        })?;

        Ok(Job {
            job_type,
            status,
            payload: serde_json::from_str(&self.payload)?,
            result: self.result.as_deref().map(serde_json::from_str).transpose()?,
            error: self.error,
            created_at: ms_to_datetime(self.created_at),
            updated_at: ms_to_datetime(self.updated_at),
            started_at: self.started_at.map(ms_to_datetime),
            completed_at: self.completed_at.map(ms_to_datetime),
            created_by: self.created_by,
            id: self.id,
        })
    }

    /// Decode a row the reaper has just failed. A payload that no longer
    /// parses is replaced by `null` so the job can still be reported.
    pub fn into_reaped_job(mut self) -> Result<Job> {
        if serde_json::from_str::<Value>(&self.payload).is_err() {
            warn!(job_id = %self.id, "Reaped job has an unreadable payload");
            self.payload = Value::Null.to_string();
        }
        self.result = None;
        self.into_job()
    }
}
