//! Workflow job webhook payloads.
//!
//! The receiver expects GitHub's `workflow_job` event shape, delivered as a form field:
//! `payload=<url-encoded JSON>`.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use crate::errors::{Error, Result};
use crate::tracker::JobTracker;

/// Form field carrying the JSON payload
pub const PAYLOAD_FIELD: &str = "payload";

/// Label marking a job as running on a self-hosted runner
pub const SELF_HOSTED_LABEL: &str = "self-hosted";

/// Lifecycle transition carried by a webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    Queued,
    InProgress,
    Completed,
}

impl JobAction {
    pub const ALL: [JobAction; 3] = [JobAction::Queued, JobAction::InProgress, JobAction::Completed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for JobAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Unknown job action: {}", s)),
        }
    }
}

/// Kind of runner a job was scheduled on, derived from its labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunnerType {
    SelfHosted,
    GithubHosted,
}

impl RunnerType {
    pub fn from_labels(labels: &[String]) -> Self {
        if labels.iter().any(|label| label == SELF_HOSTED_LABEL) {
            Self::SelfHosted
        } else {
            Self::GithubHosted
        }
    }
}

/// The `workflow_job` object of a webhook event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowJob {
    pub id: i64,
    #[serde(default)]
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// A single lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub action: JobAction,
    pub workflow_job: WorkflowJob,
}

/// Current time at the millisecond precision the receiver sees on the wire.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

impl WebhookEvent {
    /// Build the payload for one transition of `job_id`.
    ///
    /// `at` is the moment of the transition: it becomes `started_at` for `in_progress` and
    /// `completed_at` for `completed`. A `completed` event takes its `started_at` from `tracker`
    /// and fails with [`Error::MissingJobState`] when no start was recorded for the job.
    pub fn build(
        job_id: i64,
        action: JobAction,
        created_at: DateTime<Utc>,
        at: DateTime<Utc>,
        labels: Vec<String>,
        tracker: &JobTracker,
    ) -> Result<Self> {
        let (started_at, completed_at) = match action {
            JobAction::Queued => (None, None),
            JobAction::InProgress => (Some(at), None),
            JobAction::Completed => (Some(tracker.started_at(job_id)?), Some(at)),
        };

        Ok(Self {
            action,
            workflow_job: WorkflowJob {
                id: job_id,
                labels,
                created_at,
                started_at,
                completed_at,
            },
        })
    }

    pub fn job_id(&self) -> i64 {
        self.workflow_job.id
    }

    pub fn runner_type(&self) -> RunnerType {
        RunnerType::from_labels(&self.workflow_job.labels)
    }

    /// Encode as an `application/x-www-form-urlencoded` body: `payload=<url-encoded JSON>`.
    ///
    /// The returned string is exactly what gets signed and sent.
    pub fn to_form_body(&self) -> Result<String> {
        let json = serde_json::to_string(self)?;
        Ok(form_urlencoded::Serializer::new(String::new())
            .append_pair(PAYLOAD_FIELD, &json)
            .finish())
    }

    /// Decode a form body produced by [`WebhookEvent::to_form_body`].
    pub fn from_form_body(body: &[u8]) -> Result<Self> {
        let (_, json) = form_urlencoded::parse(body)
            .find(|(key, _)| key == PAYLOAD_FIELD)
            .ok_or_else(|| Error::BadRequest {
                message: "Missing payload parameter".to_string(),
            })?;

        serde_json::from_str(&json).map_err(|e| Error::BadRequest { message: e.to_string() })
    }
}
