//! Job domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::content::{EntityKind, EntityRef};
use crate::{Error, Result};

/// Payload key carrying the owning user's id.
pub const PAYLOAD_USER_ID: &str = "userId";

/// Kinds of asynchronous work the studio queues.
///
/// The declaration order is the fixed order in which the poll loop visits
/// job types each cycle.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    GeneratePodcast,
    GenerateScript,
    GenerateAudio,
    GenerateVoiceover,
    GenerateInfographic,
    ProcessUrl,
    ProcessResearch,
}

impl JobType {
    /// Every job type, in poll order.
    pub const ALL: [JobType; 7] = [
        JobType::GeneratePodcast,
        JobType::GenerateScript,
        JobType::GenerateAudio,
        JobType::GenerateVoiceover,
        JobType::GenerateInfographic,
        JobType::ProcessUrl,
        JobType::ProcessResearch,
    ];

    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    /// The kind of domain entity a job of this type produces.
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            Self::GeneratePodcast | Self::GenerateScript | Self::GenerateAudio => {
                EntityKind::Podcast
            }
            Self::GenerateVoiceover => EntityKind::Voiceover,
            Self::GenerateInfographic => EntityKind::Infographic,
            Self::ProcessUrl | Self::ProcessResearch => EntityKind::Document,
        }
    }

    /// Env-style suffix, e.g. `GENERATE_PODCAST`.
    pub fn env_key(&self) -> String {
        self.as_str().replace('-', "_").to_ascii_uppercase()
    }
}

/// Job lifecycle status.
///
/// `Display`/`as_str` give the storage form (`PROCESSING`); serde gives the
/// lowercase form carried in notifications (`processing`).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Queued, waiting to be claimed.
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    /// Finished successfully; `result` is set.
    Completed,
    /// Finished unsuccessfully or reaped; `error` is set.
    Failed,
}

impl JobStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Jobs only move forward: pending → processing → completed | failed.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
        )
    }
}

/// A unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    /// Type-specific input; always carries `userId`.
    pub payload: Value,
    /// Present only when completed.
    pub result: Option<Value>,
    /// Present only when failed.
    pub error: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// The owning user's id, used to route notifications.
    pub fn user_id(&self) -> &str {
        self.payload
            .get(PAYLOAD_USER_ID)
            .and_then(Value::as_str)
            .unwrap_or(&self.created_by)
    }

    /// The domain entity this job is producing, if the payload names one.
    pub fn entity_ref(&self) -> Option<EntityRef> {
        let kind = self.job_type.entity_kind();
        self.payload
            .get(kind.payload_key())
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(|id| EntityRef::new(kind, id))
    }

    /// Move the job to `status`, enforcing forward-only transitions and the
    /// result/error exclusivity rule.
    pub fn transition(
        &mut self,
        status: JobStatus,
        result: Option<Value>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.status.can_transition_to(status) {
            return Err(Error::invalid_transition(self.status, status));
        }

        self.status = status;
        self.updated_at = now;
        match status {
            JobStatus::Processing => {
                self.started_at = Some(now);
                self.result = None;
                self.error = None;
            }
            JobStatus::Completed => {
                self.completed_at = Some(now);
                self.result = Some(result.unwrap_or(Value::Null));
                self.error = None;
            }
            JobStatus::Failed => {
                self.completed_at = Some(now);
                self.result = None;
                self.error = Some(error.unwrap_or_else(|| "Job failed".to_string()));
            }
            JobStatus::Pending => {}
        }
        Ok(())
    }

    /// How long the job has been processing as of `now`.
    pub fn processing_age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        if self.status != JobStatus::Processing {
            return None;
        }
        let since = self.started_at.unwrap_or(self.updated_at);
        Some(now - since)
    }
}

/// A job about to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_type: JobType,
    pub payload: Value,
    pub created_by: String,
}

impl NewJob {
    /// Build a new job owned by `user_id`; the id is stamped into the payload.
    pub fn new(job_type: JobType, user_id: impl Into<String>, payload: Value) -> Self {
        let user_id = user_id.into();
        let mut payload = match payload {
            Value::Object(map) => Value::Object(map),
            Value::Null => Value::Object(Default::default()),
            other => serde_json::json!({ "data": other }),
        };
        if let Value::Object(map) = &mut payload {
            map.insert(PAYLOAD_USER_ID.to_string(), Value::String(user_id.clone()));
        }

        Self {
            job_type,
            payload,
            created_by: user_id,
        }
    }

    /// Materialize as a pending job.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: self.job_type,
            status: JobStatus::Pending,
            payload: self.payload,
            result: None,
            error: None,
            created_by: self.created_by,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending(job_type: JobType, payload: Value) -> Job {
        NewJob::new(job_type, "user-1", payload).into_job(Utc::now())
    }

    #[test]
    fn test_job_type_tags() {
        assert_eq!(JobType::GeneratePodcast.to_string(), "generate-podcast");
        assert_eq!(JobType::parse("process-url"), Some(JobType::ProcessUrl));
        assert_eq!(
            "process-research".parse::<JobType>().unwrap(),
            JobType::ProcessResearch
        );
        assert_eq!(JobType::parse("render-video"), None);
        assert_eq!(JobType::GenerateVoiceover.env_key(), "GENERATE_VOICEOVER");
        for job_type in JobType::ALL {
            assert_eq!(job_type.as_str(), job_type.to_string());
            assert_eq!(JobType::parse(job_type.as_str()), Some(job_type));
        }
    }

    #[test]
    fn test_status_storage_and_wire_forms() {
        assert_eq!(JobStatus::Processing.as_str(), "PROCESSING");
        assert_eq!(JobStatus::Processing.to_string(), "PROCESSING");
        assert_eq!(JobStatus::parse("FAILED"), Some(JobStatus::Failed));
        assert_eq!(JobStatus::parse("failed"), None);
        assert_eq!(
            serde_json::to_value(JobStatus::Processing).unwrap(),
            "processing"
        );
    }

    #[test]
    fn test_all_is_in_declaration_order() {
        let mut sorted = JobType::ALL;
        sorted.sort();
        assert_eq!(sorted, JobType::ALL);
    }

    #[test]
    fn test_status_transitions_are_forward_only() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Processing));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_new_job_stamps_user_id() {
        let job = pending(JobType::ProcessUrl, json!({ "documentId": "doc-1" }));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.user_id(), "user-1");
        assert_eq!(job.payload["documentId"], "doc-1");
        assert!(job.result.is_none() && job.error.is_none());
    }

    #[test]
    fn test_entity_ref_follows_job_type() {
        let job = pending(JobType::GenerateAudio, json!({ "podcastId": "pod-9" }));
        assert_eq!(
            job.entity_ref(),
            Some(EntityRef::new(EntityKind::Podcast, "pod-9"))
        );

        let job = pending(JobType::GenerateInfographic, json!({ "podcastId": "pod-9" }));
        assert_eq!(job.entity_ref(), None);
    }

    #[test]
    fn test_transition_keeps_result_and_error_exclusive() {
        let now = Utc::now();
        let mut job = pending(JobType::GenerateScript, json!({}));
        job.transition(JobStatus::Processing, None, None, now).unwrap();
        assert_eq!(job.started_at, Some(now));

        job.transition(JobStatus::Failed, Some(json!({"x": 1})), Some("boom".into()), now)
            .unwrap();
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert!(job.result.is_none());
        assert!(job.completed_at.is_some());

        let err = job
            .transition(JobStatus::Completed, None, None, now)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_serializes_with_type_tag() {
        let job = pending(JobType::GenerateVoiceover, json!({}));
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "generate-voiceover");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["createdBy"], "user-1");
    }
}
