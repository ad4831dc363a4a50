// Producer side: everything is checked before anything is written, so a
// rejected submission leaves no trace in the store.

use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::jobs::model::{JobRecord, NewJob};
use crate::jobs::queue::Queue;
use crate::jobs::registry::HandlerRegistry;
use crate::jobs::retry::with_backoff;

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub max_payload_bytes: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 256 * 1024, // 256KB default
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    queue: Queue,
    registry: Arc<HandlerRegistry>,
    cfg: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(queue: Queue, registry: Arc<HandlerRegistry>, cfg: DispatcherConfig) -> Self {
        Self {
            queue,
            registry,
            cfg,
        }
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.cfg.max_payload_bytes
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn check(&self, job: &NewJob) -> Result<()> {
        if job.payload.is_null() {
            return Err(Error::validation("payload must not be null"));
        }

        let size = serde_json::to_vec(&job.payload)
            .map_err(|e| Error::validation(format!("payload is not serializable: {e}")))?
            .len();
        if size > self.cfg.max_payload_bytes {
            return Err(Error::PayloadTooLarge {
                size,
                max: self.cfg.max_payload_bytes,
            });
        }

        if job.max_attempts == Some(0) {
            return Err(Error::validation("max_attempts must be at least 1"));
        }

        self.registry.validate(&job.job_type, &job.payload)
    }

    /// Validates, persists a QUEUED record, enqueues its id and returns it.
    pub async fn submit(&self, job: NewJob) -> Result<Uuid> {
        self.check(&job)?;

        let max_attempts = job.max_attempts.unwrap_or(self.queue.config().max_attempts);
        let job_id = Uuid::new_v4();
        let record = JobRecord::queued(job_id, self.queue.name(), job, max_attempts);

        let (repo, record_ref) = (self.queue.repo(), &record);
        let created = with_backoff(&self.queue.config().retry, "create job", || async move {
            repo.insert(record_ref).await
        })
        .await?;
        if created.is_none() {
            // ids are fresh, so a taken id means an earlier try landed
            tracing::debug!(job_id = %job_id, "job record already present");
        }

        if let Err(e) = self.queue.enqueue(job_id).await {
            // never hand out an id for a job that can't be delivered
            match repo.delete(job_id).await {
                Ok(_) => {}
                Err(cleanup) => {
                    tracing::error!(job_id = %job_id, error = %cleanup, "failed to remove undeliverable job")
                }
            }
            return Err(e);
        }

        tracing::info!(
            job_id = %job_id,
            job_type = %record.job_type,
            queue = %record.queue,
            max_attempts,
            "job submitted"
        );
        Ok(job_id)
    }
}
