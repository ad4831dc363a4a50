use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{ErrorKind, Result};
use crate::jobs::error_codes::ErrorCode;
use crate::jobs::model::{JobFailure, JobState, Outcome};
use crate::jobs::queue::{to_chrono, Queue};
use crate::jobs::repo::StoredJob;

/// Counts from one reaper pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    /// Lapsed leases put back on the queue.
    pub requeued: u64,
    /// Lapsed leases with no attempts left, written FAILED.
    pub failed: u64,
    /// References popped but never claimed, pushed back.
    pub recovered: u64,
    /// Index entries for jobs that are gone or already terminal.
    pub cleaned: u64,
    /// Entries whose lease was extended after they were parked.
    pub rescored: u64,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn record(&mut self, action: ReapAction) {
        match action {
            ReapAction::Requeued => self.requeued += 1,
            ReapAction::Failed => self.failed += 1,
            ReapAction::Recovered => self.recovered += 1,
            ReapAction::Cleaned => self.cleaned += 1,
            ReapAction::Rescored => self.rescored += 1,
            ReapAction::Skipped => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReapAction {
    Requeued,
    Failed,
    Recovered,
    Cleaned,
    Rescored,
    /// Someone else wrote the record between our read and our write.
    Skipped,
}

/// Reclaims jobs whose lease lapsed without a terminal outcome.
///
/// Runs independently of workers, so a crashed worker's job is recovered
/// even when no worker is dequeuing.
#[derive(Clone)]
pub struct Reaper {
    queue: Queue,
    batch_size: usize,
}

impl Reaper {
    pub fn new(queue: Queue, batch_size: usize) -> Self {
        Self {
            queue,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn reap_once(&self) -> Result<ReapReport> {
        let now = Utc::now();
        let index = self.queue.lease_index();
        let store = self.queue.repo().store();

        let due = store
            .index_range(&index, now.timestamp_millis(), self.batch_size)
            .await?;

        let mut report = ReapReport::default();
        for member in due {
            let Ok(job_id) = member.parse::<Uuid>() else {
                store.index_remove(&index, &member).await?;
                report.record(ReapAction::Cleaned);
                continue;
            };

            match self.reap_one(job_id, now).await {
                Ok(action) => report.record(action),
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    // An unreadable record can never be delivered; stop revisiting it.
                    tracing::error!(job_id = %job_id, error = %e, "dropping unreadable lease entry");
                    store.index_remove(&index, &member).await?;
                    report.record(ReapAction::Cleaned);
                }
            }
        }

        if !report.is_empty() {
            tracing::info!(
                queue = %self.queue.name(),
                requeued = report.requeued,
                failed = report.failed,
                recovered = report.recovered,
                cleaned = report.cleaned,
                rescored = report.rescored,
                "reaper pass"
            );
        }
        Ok(report)
    }

    async fn reap_one(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<ReapAction> {
        let index = self.queue.lease_index();
        let member = job_id.to_string();
        let repo = self.queue.repo();
        let store = repo.store();

        let Some(StoredJob {
            mut record,
            version,
        }) = repo.get_job(job_id).await?
        else {
            store.index_remove(&index, &member).await?;
            return Ok(ReapAction::Cleaned);
        };

        match record.state {
            JobState::Finished | JobState::Failed | JobState::Expired => {
                store.index_remove(&index, &member).await?;
                Ok(ReapAction::Cleaned)
            }
            JobState::Queued => {
                // popped by a worker that died before claiming it
                self.queue.push_reference(job_id).await?;
                store.index_remove(&index, &member).await?;
                tracing::warn!(job_id = %job_id, "recovered unclaimed job reference");
                Ok(ReapAction::Recovered)
            }
            JobState::Running if !record.lease_lapsed(now) => {
                if let Some(deadline) = record.visibility_deadline {
                    store
                        .index_set(&index, &member, deadline.timestamp_millis())
                        .await?;
                }
                Ok(ReapAction::Rescored)
            }
            JobState::Running if record.attempts_exhausted() => {
                let previous_owner = record.lease_owner.clone();
                let retention = self.queue.config().failure_ttl;
                let failure = JobFailure {
                    kind: ErrorKind::MaxAttemptsExceeded,
                    code: ErrorCode::LeaseExpired.as_str().to_string(),
                    message: format!(
                        "lease lapsed on attempt {}/{} without an outcome",
                        record.attempt_count, record.max_attempts
                    ),
                };
                record.finish(Outcome::Failed(failure), now, to_chrono(retention));

                if repo.update(&record, version, Some(retention)).await?.is_none() {
                    return Ok(ReapAction::Skipped);
                }
                store.index_remove(&index, &member).await?;
                tracing::warn!(
                    job_id = %job_id,
                    worker_id = previous_owner.as_deref().unwrap_or("-"),
                    attempt = record.attempt_count,
                    "lease lapsed with no attempts left, job failed"
                );
                Ok(ReapAction::Failed)
            }
            JobState::Running => {
                let previous_owner = record.lease_owner.clone();
                record.requeue();

                if repo.update(&record, version, None).await?.is_none() {
                    return Ok(ReapAction::Skipped);
                }
                // A failed push leaves a QUEUED record behind a lapsed entry,
                // which the next pass recovers.
                self.queue.push_reference(job_id).await?;
                store.index_remove(&index, &member).await?;
                tracing::warn!(
                    job_id = %job_id,
                    worker_id = previous_owner.as_deref().unwrap_or("-"),
                    attempt = record.attempt_count,
                    "lease lapsed, job requeued"
                );
                Ok(ReapAction::Requeued)
            }
        }
    }

    /// Reaps every `interval` until `shutdown` flips to true.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(queue = %self.queue.name(), interval_ms = interval.as_millis() as u64, "reaper started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.reap_once().await {
                tracing::error!(queue = %self.queue.name(), error = %e, "reaper pass failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!(queue = %self.queue.name(), "reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{JobRecord, NewJob};
    use crate::jobs::repo::JobsRepo;
    use crate::jobs::queue::QueueConfig;
    use crate::store::{MemoryStore, Store};
    use serde_json::json;
    use std::sync::Arc;

    fn queue(store: Arc<MemoryStore>, lease: Duration, max_attempts: u32) -> Queue {
        Queue::new(
            JobsRepo::new(store, "test"),
            QueueConfig {
                lease_duration: lease,
                max_attempts,
                ..QueueConfig::default()
            },
        )
    }

    async fn submit(queue: &Queue, max_attempts: u32) -> Uuid {
        let id = Uuid::new_v4();
        let record = JobRecord::queued(id, queue.name(), NewJob::new("process_job", json!({})), max_attempts);
        queue.repo().insert(&record).await.unwrap().unwrap();
        queue.enqueue(id).await.unwrap();
        id
    }

    #[tokio::test]
    async fn lapsed_lease_is_requeued_then_failed_when_exhausted() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue(store, Duration::from_millis(20), 2);
        let reaper = Reaper::new(queue.clone(), 10);
        let id = submit(&queue, 2).await;

        let lease = queue.dequeue("w1", Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(lease.attempt(), 1);
        tokio::time::sleep(Duration::from_millis(40)).await;

        let report = reaper.reap_once().await.unwrap();
        assert_eq!(report.requeued, 1);
        let stored = queue.repo().get_job(id).await.unwrap().unwrap();
        assert_eq!(stored.record.state, JobState::Queued);
        assert_eq!(stored.record.lease_owner, None);

        let lease = queue.dequeue("w2", Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(lease.attempt(), 2);
        tokio::time::sleep(Duration::from_millis(40)).await;

        let report = reaper.reap_once().await.unwrap();
        assert_eq!(report.failed, 1);
        let stored = queue.repo().get_job(id).await.unwrap().unwrap();
        assert_eq!(stored.record.state, JobState::Failed);
        let failure = stored.record.error.unwrap();
        assert_eq!(failure.kind, ErrorKind::MaxAttemptsExceeded);
        assert_eq!(failure.code, "LEASE_EXPIRED");
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn live_leases_are_left_alone() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue(store, Duration::from_secs(30), 3);
        let reaper = Reaper::new(queue.clone(), 10);
        let id = submit(&queue, 3).await;

        let _lease = queue.dequeue("w1", Duration::from_millis(50)).await.unwrap().unwrap();
        assert!(reaper.reap_once().await.unwrap().is_empty());
        let stored = queue.repo().get_job(id).await.unwrap().unwrap();
        assert_eq!(stored.record.state, JobState::Running);
    }

    #[tokio::test]
    async fn unclaimed_and_dangling_entries_are_repaired() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue(store.clone(), Duration::from_secs(30), 3);
        let reaper = Reaper::new(queue.clone(), 10);
        let index = queue.lease_index();

        // a worker popped this one and died before its claim landed
        let id = submit(&queue, 3).await;
        let list = queue.repo().queue_key(queue.name());
        let popped = store
            .blocking_pop(&list, Duration::ZERO, Some(crate::store::Park { index: &index, score: 0 }))
            .await
            .unwrap();
        assert_eq!(popped, Some(id.to_string()));

        // an entry for a job that no longer exists
        store.index_set(&index, &Uuid::new_v4().to_string(), 0).await.unwrap();

        let report = reaper.reap_once().await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.cleaned, 1);
        assert_eq!(queue.depth().await.unwrap(), 1);
        assert!(store.index_range(&index, i64::MAX, 10).await.unwrap().is_empty());
    }
}
