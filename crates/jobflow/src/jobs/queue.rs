//! Named FIFO queue over the store, with lease-based delivery.
//!
//! A dequeue pops a job reference and parks it in the queue's lease index in
//! one atomic step, then claims the record with a conditional write. Until the
//! record's `visibility_deadline` passes, no other worker can claim it; the
//! [`Reaper`](crate::jobs::reaper::Reaper) recovers anything whose lease lapses.

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::jobs::model::{JobRecord, JobState, Outcome};
use crate::jobs::repo::{JobsRepo, StoredJob};
use crate::jobs::retry::{with_backoff, RetryConfig};
use crate::store::Park;

/// Owned writes retry this many times when only the version moved underneath us.
const OWNED_WRITE_TRIES: usize = 3;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub lease_duration: Duration,
    pub max_attempts: u32,
    /// Retention of FINISHED records.
    pub result_ttl: Duration,
    /// Retention of FAILED records.
    pub failure_ttl: Duration,
    pub retry: RetryConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            lease_duration: Duration::from_secs(30),
            max_attempts: 3,
            result_ttl: Duration::from_secs(500),
            failure_ttl: Duration::from_secs(365 * 24 * 60 * 60),
            retry: RetryConfig::default(),
        }
    }
}

impl QueueConfig {
    pub fn retention_for(&self, state: JobState) -> Duration {
        match state {
            JobState::Failed => self.failure_ttl,
            _ => self.result_ttl,
        }
    }
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

/// One worker's claim on one delivery of a job.
#[derive(Debug, Clone)]
pub struct Lease {
    job: JobRecord,
    version: u64,
    worker_id: String,
}

impl Lease {
    pub fn job(&self) -> &JobRecord {
        &self.job
    }

    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    pub fn attempt(&self) -> u32 {
        self.job.attempt_count
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.job.visibility_deadline
    }
}

#[derive(Clone)]
pub struct Queue {
    repo: JobsRepo,
    cfg: QueueConfig,
}

impl Queue {
    pub fn new(repo: JobsRepo, cfg: QueueConfig) -> Self {
        Self { repo, cfg }
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.cfg
    }

    pub fn repo(&self) -> &JobsRepo {
        &self.repo
    }

    fn list_key(&self) -> String {
        self.repo.queue_key(&self.cfg.name)
    }

    fn index_key(&self) -> String {
        self.repo.lease_index_key(&self.cfg.name)
    }

    // ----------------------------
    // Producer side
    // ----------------------------

    /// Pushes `job_id` onto the tail of the queue, retrying transient failures.
    pub async fn enqueue(&self, job_id: Uuid) -> Result<()> {
        let list = self.list_key();
        let member = job_id.to_string();
        let (store, list, member) = (self.repo.store(), &list, &member);

        with_backoff(&self.cfg.retry, "enqueue", || async move {
            Ok(store.list_push(list, member).await?)
        })
        .await?;

        tracing::debug!(queue = %self.cfg.name, job_id = %job_id, "job enqueued");
        Ok(())
    }

    pub async fn depth(&self) -> Result<u64> {
        Ok(self.repo.store().list_len(&self.list_key()).await?)
    }

    // ----------------------------
    // Delivery
    // ----------------------------

    /// Waits up to `timeout` for a job and claims it for `worker_id`.
    ///
    /// `Ok(None)` is a timeout, not an error. Stale references (record gone,
    /// terminal, or already claimed) are skipped inside the same wait.
    pub async fn dequeue(&self, worker_id: &str, timeout: Duration) -> Result<Option<Lease>> {
        let list = self.list_key();
        let index = self.index_key();
        let started = Instant::now();

        loop {
            let remaining = timeout.saturating_sub(started.elapsed());
            let parked_until = Utc::now() + to_chrono(self.cfg.lease_duration);

            let popped = self
                .repo
                .store()
                .blocking_pop(
                    &list,
                    remaining,
                    Some(Park {
                        index: &index,
                        score: parked_until.timestamp_millis(),
                    }),
                )
                .await?;

            let Some(raw) = popped else {
                return Ok(None);
            };

            match raw.parse::<Uuid>() {
                Ok(job_id) => {
                    if let Some(lease) = self.claim(job_id, worker_id).await? {
                        return Ok(Some(lease));
                    }
                }
                Err(_) => {
                    tracing::warn!(queue = %self.cfg.name, reference = %raw, "dropping malformed job reference");
                    self.repo.store().index_remove(&index, &raw).await?;
                }
            }

            if started.elapsed() >= timeout {
                return Ok(None);
            }
        }
    }

    async fn claim(&self, job_id: Uuid, worker_id: &str) -> Result<Option<Lease>> {
        let Some(StoredJob {
            mut record,
            version,
        }) = self.repo.get_job(job_id).await?
        else {
            // expired or deleted before delivery
            self.repo
                .store()
                .index_remove(&self.index_key(), &job_id.to_string())
                .await?;
            tracing::debug!(job_id = %job_id, "skipping reference to missing job");
            return Ok(None);
        };

        if record.state != JobState::Queued {
            tracing::debug!(job_id = %job_id, state = %record.state, "skipping stale reference");
            return Ok(None);
        }

        let now = Utc::now();
        record.claim(worker_id, now + to_chrono(self.cfg.lease_duration), now);

        match self.repo.update(&record, version, None).await? {
            Some(version) => {
                tracing::info!(
                    queue = %self.cfg.name,
                    job_id = %job_id,
                    job_type = %record.job_type,
                    worker_id,
                    attempt = record.attempt_count,
                    "job claimed"
                );
                Ok(Some(Lease {
                    job: record,
                    version,
                    worker_id: worker_id.to_string(),
                }))
            }
            None => {
                tracing::debug!(job_id = %job_id, worker_id, "lost claim race");
                Ok(None)
            }
        }
    }

    /// Extends the lease to `now + lease_duration`.
    pub async fn heartbeat(&self, lease: &mut Lease) -> Result<()> {
        let deadline = Utc::now() + to_chrono(self.cfg.lease_duration);
        let stored = self
            .write_owned(lease, None, |r| r.visibility_deadline = Some(deadline))
            .await?;

        lease.job = stored.record;
        lease.version = stored.version;

        self.repo
            .store()
            .index_set(
                &self.index_key(),
                &lease.job_id().to_string(),
                deadline.timestamp_millis(),
            )
            .await?;

        tracing::debug!(job_id = %lease.job_id(), worker_id = %lease.worker_id, %deadline, "lease extended");
        Ok(())
    }

    /// Single terminal write for this delivery. Fails with `LeaseLost` when the
    /// record was reclaimed; safe to call again after an ambiguous store error.
    pub async fn complete(&self, lease: &Lease, outcome: &Outcome) -> Result<StoredJob> {
        let retention = self.cfg.retention_for(outcome.state());
        let now = Utc::now();

        let written = self
            .write_owned(lease, Some(retention), |r| {
                r.finish(outcome.clone(), now, to_chrono(retention))
            })
            .await;

        match written {
            Err(Error::LeaseLost(job_id)) => {
                // An earlier try may have landed before its response was lost.
                // The reaper keeps the owner when it fails a lapsed job, so the
                // stored outcome itself has to match.
                match self.repo.get_job(job_id).await? {
                    Some(current)
                        if current.record.holds(outcome)
                            && current.record.attempt_count == lease.attempt()
                            && current.record.lease_owner.as_deref()
                                == Some(lease.worker_id.as_str()) =>
                    {
                        Ok(current)
                    }
                    _ => Err(Error::LeaseLost(job_id)),
                }
            }
            other => other,
        }
    }

    /// Drops lease bookkeeping once the job is terminal (or gone). Idempotent,
    /// and a no-op while the job is still live so it never strips a newer owner.
    pub async fn ack(&self, job_id: Uuid) -> Result<()> {
        if let Some(stored) = self.repo.get_job(job_id).await? {
            if !stored.record.state.is_terminal() {
                tracing::debug!(job_id = %job_id, state = %stored.record.state, "ack ignored for live job");
                return Ok(());
            }
        }
        self.repo
            .store()
            .index_remove(&self.index_key(), &job_id.to_string())
            .await?;
        Ok(())
    }

    async fn write_owned<F>(&self, lease: &Lease, ttl: Option<Duration>, apply: F) -> Result<StoredJob>
    where
        F: Fn(&mut JobRecord),
    {
        let job_id = lease.job_id();
        let mut base = lease.job.clone();
        let mut expected = lease.version;

        for _ in 0..OWNED_WRITE_TRIES {
            let mut next = base.clone();
            apply(&mut next);

            if let Some(version) = self.repo.update(&next, expected, ttl).await? {
                return Ok(StoredJob {
                    record: next,
                    version,
                });
            }

            match self.repo.get_job(job_id).await? {
                Some(current) if current.record.is_leased_by(&lease.worker_id, lease.attempt()) => {
                    base = current.record;
                    expected = current.version;
                }
                _ => return Err(Error::LeaseLost(job_id)),
            }
        }

        Err(Error::LeaseLost(job_id))
    }

    // ----------------------------
    // Reclaim support (used by the reaper)
    // ----------------------------

    pub(crate) fn lease_index(&self) -> String {
        self.index_key()
    }

    pub(crate) async fn push_reference(&self, job_id: Uuid) -> Result<()> {
        Ok(self
            .repo
            .store()
            .list_push(&self.list_key(), &job_id.to_string())
            .await?)
    }
}
