//! The persistent job queue as the engine consumes it.
//!
//! The queue is the sole arbiter of job ownership: `claim_next_job` must move
//! at most one pending job to processing per call, atomically, so that any
//! number of workers may poll the same queue.

mod job;
mod memory;

pub use job::{Job, JobStatus, JobType, NewJob, PAYLOAD_USER_ID};
pub use memory::MemoryJobQueue;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::Result;

/// Error recorded on jobs failed by the stale job reaper.
pub const STALE_JOB_ERROR: &str =
    "Job timed out: no completion was reported within the maximum processing time";

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Atomically claim the oldest pending job of `job_type`, moving it to
    /// processing. `None` when nothing is pending.
    async fn claim_next_job(&self, job_type: JobType) -> Result<Option<Job>>;

    /// Record a status change; `result` applies to completed and `error` to
    /// failed jobs.
    async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<Job>;

    /// Fetch a job; `Error::NotFound` when it does not exist.
    async fn get_job(&self, id: &str) -> Result<Job>;

    /// Atomically fail every job processing for longer than `max_age`,
    /// returning the jobs that were failed.
    async fn fail_stale_jobs(&self, max_age: Duration) -> Result<Vec<Job>>;

    /// Oldest pending or processing job of `job_type` whose payload holds
    /// the string `value` under the top-level `payload_key`.
    async fn find_active_job(
        &self,
        job_type: JobType,
        payload_key: &str,
        value: &str,
    ) -> Result<Option<Job>>;

    async fn enqueue(&self, job: NewJob) -> Result<Job>;
}
