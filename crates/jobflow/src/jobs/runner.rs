use serde_json::Value;

use crate::error::{Error, Result};
use crate::jobs::model::{JobFailure, Outcome};
use crate::jobs::queue::{Lease, Queue};
use crate::jobs::registry::JobError;
use crate::jobs::retry::{with_backoff, RetryConfig};

/// Records the outcome of a delivery: one terminal write, then the ack.
#[derive(Clone)]
pub struct JobRunner {
    queue: Queue,
    retry_cfg: RetryConfig,
}

impl JobRunner {
    pub fn new(queue: Queue, retry_cfg: RetryConfig) -> Self {
        Self { queue, retry_cfg }
    }

    pub async fn on_success(&self, lease: &Lease, result: Value) -> Result<bool> {
        self.record(lease, Outcome::Finished(result)).await
    }

    pub async fn on_failure(&self, lease: &Lease, err: &JobError) -> Result<bool> {
        let failure = JobFailure::raised(err.code, err.message.clone());
        self.record(lease, Outcome::Failed(failure)).await
    }

    /// `Ok(false)` means the lease was lost first and the outcome was discarded.
    /// Transient errors are retried with backoff; when the budget runs out the
    /// error is returned and the job is left for the reaper.
    pub async fn record(&self, lease: &Lease, outcome: Outcome) -> Result<bool> {
        let job_id = lease.job_id();
        let (queue, outcome_ref) = (&self.queue, &outcome);

        let written = with_backoff(&self.retry_cfg, "record outcome", || async move {
            queue.complete(lease, outcome_ref).await
        })
        .await;

        match written {
            Ok(stored) => {
                tracing::debug!(
                    job_id = %job_id,
                    state = %stored.record.state,
                    version = stored.version,
                    "outcome recorded"
                );
            }
            Err(Error::LeaseLost(_)) => {
                tracing::warn!(
                    job_id = %job_id,
                    worker_id = %lease.worker_id(),
                    attempt = lease.attempt(),
                    "lease lost before the outcome was written, discarding it"
                );
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        // The reaper also clears entries of terminal jobs, so a failed ack is only noise.
        if let Err(e) = with_backoff(&self.retry_cfg, "ack", || async move { queue.ack(job_id).await }).await {
            tracing::warn!(job_id = %job_id, error = %e, "ack failed");
        }
        Ok(true)
    }
}
