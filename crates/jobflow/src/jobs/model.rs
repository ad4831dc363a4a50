use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Running,
    Finished,
    Failed,
    /// Read-time projection only; never persisted.
    Expired,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::Finished => "FINISHED",
            JobState::Failed => "FAILED",
            JobState::Expired => "EXPIRED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished | JobState::Failed)
    }

    /// Stored transitions. `Running -> Queued` is the reaper's reclaim path.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Running)
                | (JobState::Running, JobState::Finished)
                | (JobState::Running, JobState::Failed)
                | (JobState::Running, JobState::Queued)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored failure outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
}

impl JobFailure {
    pub fn raised(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::JobRaised,
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub queue: String,
    pub job_type: String,
    pub payload: Value,
    pub state: JobState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,

    pub visibility_deadline: Option<DateTime<Utc>>,
    pub lease_owner: Option<String>,
    pub attempt_count: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub payload: Value,
    pub max_attempts: Option<u32>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

impl JobRecord {
    pub fn queued(id: Uuid, queue: &str, job: NewJob, max_attempts: u32) -> Self {
        Self {
            id,
            queue: queue.to_string(),
            job_type: job.job_type,
            payload: job.payload,
            state: JobState::Queued,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            expires_at: None,
            visibility_deadline: None,
            lease_owner: None,
            attempt_count: 0,
            max_attempts,
        }
    }

    /// True while `worker_id` owns delivery `attempt` of a running job.
    pub fn is_leased_by(&self, worker_id: &str, attempt: u32) -> bool {
        self.state == JobState::Running
            && self.attempt_count == attempt
            && self.lease_owner.as_deref() == Some(worker_id)
    }

    pub fn lease_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Running && self.visibility_deadline.map_or(true, |d| d <= now)
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    /// State as seen by readers: terminal records past retention are `Expired`.
    pub fn projected_state(&self, now: DateTime<Utc>) -> JobState {
        match self.expires_at {
            Some(at) if self.state.is_terminal() && at <= now => JobState::Expired,
            _ => self.state,
        }
    }

    /// True when the stored terminal outcome is exactly `outcome`.
    pub fn holds(&self, outcome: &Outcome) -> bool {
        match outcome {
            // a null result reads back as `None`
            Outcome::Finished(result) => {
                self.state == JobState::Finished
                    && self.result.as_ref().unwrap_or(&Value::Null) == result
            }
            Outcome::Failed(failure) => {
                self.state == JobState::Failed && self.error.as_ref() == Some(failure)
            }
        }
    }

    pub(crate) fn claim(&mut self, worker_id: &str, deadline: DateTime<Utc>, now: DateTime<Utc>) {
        debug_assert!(self.state.can_transition_to(JobState::Running));
        self.state = JobState::Running;
        self.attempt_count += 1;
        self.lease_owner = Some(worker_id.to_string());
        self.visibility_deadline = Some(deadline);
        if self.started_at.is_none() {
            self.started_at = Some(now.max(self.created_at));
        }
    }

    pub(crate) fn requeue(&mut self) {
        debug_assert!(self.state.can_transition_to(JobState::Queued));
        self.state = JobState::Queued;
        self.lease_owner = None;
        self.visibility_deadline = None;
    }

    /// Single terminal write; `lease_owner` is kept as the finishing worker.
    pub(crate) fn finish(&mut self, outcome: Outcome, now: DateTime<Utc>, retention: chrono::Duration) {
        let finished_at = self
            .started_at
            .map_or(now, |started| now.max(started))
            .max(self.created_at);
        match outcome {
            Outcome::Finished(result) => {
                debug_assert!(self.state.can_transition_to(JobState::Finished));
                self.state = JobState::Finished;
                self.result = Some(result);
                self.error = None;
            }
            Outcome::Failed(failure) => {
                debug_assert!(self.state.can_transition_to(JobState::Failed));
                self.state = JobState::Failed;
                self.result = None;
                self.error = Some(failure);
            }
        }
        self.finished_at = Some(finished_at);
        self.expires_at = Some(finished_at + retention);
        self.visibility_deadline = None;
    }
}

/// What a delivery ended with.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Finished(Value),
    Failed(JobFailure),
}

impl Outcome {
    pub fn state(&self) -> JobState {
        match self {
            Outcome::Finished(_) => JobState::Finished,
            Outcome::Failed(_) => JobState::Failed,
        }
    }
}
