use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::jobs::model::{JobFailure, JobState};
use crate::jobs::repo::{JobsRepo, StoredJob};
use crate::jobs::retry::{with_backoff, RetryConfig};

#[derive(Debug, Clone, PartialEq)]
pub enum StatusOutcome {
    Found(JobState),
    NotFoundOrExpired,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResultOutcome {
    /// Not terminal yet; carries the current state.
    Pending(JobState),
    Finished(Value),
    Failed(JobFailure),
    NotFoundOrExpired,
}

/// Read path. Never writes, so it can serve any number of callers.
#[derive(Clone)]
pub struct StatusService {
    repo: JobsRepo,
    retry: RetryConfig,
}

impl StatusService {
    pub fn new(repo: JobsRepo, retry: RetryConfig) -> Self {
        Self { repo, retry }
    }

    pub async fn get_status(&self, job_id: Uuid) -> Result<StatusOutcome> {
        Ok(match self.load(job_id).await? {
            Some(stored) => StatusOutcome::Found(stored.record.state),
            None => StatusOutcome::NotFoundOrExpired,
        })
    }

    pub async fn get_result(&self, job_id: Uuid) -> Result<ResultOutcome> {
        let Some(StoredJob { record, .. }) = self.load(job_id).await? else {
            return Ok(ResultOutcome::NotFoundOrExpired);
        };

        Ok(match (record.state, record.result, record.error) {
            (JobState::Finished, Some(result), _) => ResultOutcome::Finished(result),
            (JobState::Failed, _, Some(failure)) => ResultOutcome::Failed(failure),
            (state, _, _) => ResultOutcome::Pending(state),
        })
    }

    /// Live records only: anything past its retention reads as absent, even
    /// if the store has not reclaimed it yet.
    async fn load(&self, job_id: Uuid) -> Result<Option<StoredJob>> {
        let repo = &self.repo;
        let stored = with_backoff(&self.retry, "read job", || async move {
            repo.get_job(job_id).await
        })
        .await?;

        Ok(stored.filter(|s| s.record.projected_state(Utc::now()) != JobState::Expired))
    }
}
