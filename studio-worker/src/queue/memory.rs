//! In-process job queue.

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::time::Duration;

use super::{Job, JobQueue, JobStatus, JobType, NewJob, STALE_JOB_ERROR};
use crate::{Error, Result};

/// Job queue held in memory behind a single lock, which makes every
/// operation atomic with respect to the others.
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    jobs: Mutex<Vec<Job>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job as-is, in whatever state it is in.
    pub fn insert(&self, job: Job) {
        self.jobs.lock().push(job);
    }

    /// Snapshot of every job.
    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().clone()
    }

    pub fn count_by_status(&self, status: JobStatus) -> usize {
        self.jobs.lock().iter().filter(|j| j.status == status).count()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn claim_next_job(&self, job_type: JobType) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Pending && j.job_type == job_type)
            .min_by_key(|j| j.created_at)
        else {
            return Ok(None);
        };

        job.transition(JobStatus::Processing, None, None, Utc::now())?;
        Ok(Some(job.clone()))
    }

    async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<Job> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| Error::not_found("Job", id))?;

        job.transition(status, result, error, Utc::now())?;
        Ok(job.clone())
    }

    async fn get_job(&self, id: &str) -> Result<Job> {
        self.jobs
            .lock()
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn fail_stale_jobs(&self, max_age: Duration) -> Result<Vec<Job>> {
        let max_age = TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX);
        let now = Utc::now();

        let mut jobs = self.jobs.lock();
        let mut reaped = Vec::new();
        for job in jobs.iter_mut() {
            let Some(age) = job.processing_age(now) else {
                continue;
            };
            if age > max_age {
                job.transition(
                    JobStatus::Failed,
                    None,
                    Some(STALE_JOB_ERROR.to_string()),
                    now,
                )?;
                reaped.push(job.clone());
            }
        }
        Ok(reaped)
    }

    async fn find_active_job(
        &self,
        job_type: JobType,
        payload_key: &str,
        value: &str,
    ) -> Result<Option<Job>> {
        Ok(self
            .jobs
            .lock()
            .iter()
            .filter(|j| j.job_type == job_type && !j.status.is_terminal())
            .filter(|j| j.payload.get(payload_key).and_then(Value::as_str) == Some(value))
            .min_by_key(|j| j.created_at)
            .cloned())
    }

    async fn enqueue(&self, job: NewJob) -> Result<Job> {
        let job = job.into_job(Utc::now());
        self.jobs.lock().push(job.clone());
        Ok(job)
    }
}
