use rand::thread_rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::{Error, Result};
use crate::jobs::error_codes::ErrorCode;
use crate::jobs::queue::{Lease, Queue};
use crate::jobs::registry::{HandlerRegistry, JobContext, JobError};
use crate::jobs::retry::{next_delay, RetryConfig};
use crate::jobs::runner::JobRunner;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Longest single wait on an empty queue before re-checking shutdown.
    pub dequeue_timeout: Duration,
    /// Must be well under the queue's lease duration.
    pub heartbeat_interval: Duration,
    pub retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            dequeue_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }
}

/// Per-worker counters.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    processed: Arc<AtomicU64>,
    succeeded: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    abandoned: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Deliveries whose lease was lost before an outcome was written.
    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }
}

/// Handle for a worker started with [`Worker::start`].
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    stats: WorkerStats,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stops taking new jobs; the job in hand is finished first.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub async fn join(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "worker task ended abnormally");
        }
    }
}

/// Explicit dequeue, execute, record loop for one queue.
#[derive(Clone)]
pub struct Worker {
    id: String,
    queue: Queue,
    registry: Arc<HandlerRegistry>,
    runner: JobRunner,
    cfg: WorkerConfig,
    stats: WorkerStats,
}

enum Delivery {
    Done(std::result::Result<serde_json::Value, JobError>),
    LeaseLost,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: Queue,
        registry: Arc<HandlerRegistry>,
        cfg: WorkerConfig,
    ) -> Self {
        let runner = JobRunner::new(queue.clone(), cfg.retry.clone());
        Self {
            id: id.into(),
            queue,
            registry,
            runner,
            cfg,
            stats: WorkerStats::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn start(self) -> WorkerHandle {
        let (shutdown, rx) = watch::channel(false);
        let stats = self.stats.clone();
        let task = tokio::spawn(async move { self.run(rx).await });
        WorkerHandle {
            shutdown,
            stats,
            task,
        }
    }

    /// Runs until `shutdown` flips to true. Store outages are ridden out with
    /// backoff; nothing in here ends the loop except shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker_id = %self.id, queue = %self.queue.name(), "worker started");
        let mut consecutive_errors = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let leased = tokio::select! {
                res = self.queue.dequeue(&self.id, self.cfg.dequeue_timeout) => res,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match leased {
                Ok(Some(lease)) => {
                    consecutive_errors = 0;
                    if let Err(e) = self.process(lease).await {
                        tracing::error!(worker_id = %self.id, error = %e, "failed to record job outcome");
                    }
                }
                Ok(None) => consecutive_errors = 0,
                Err(e) => {
                    consecutive_errors += 1;
                    let delay = next_delay(consecutive_errors, &self.cfg.retry, &mut thread_rng());
                    tracing::warn!(
                        worker_id = %self.id,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "dequeue failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        tracing::info!(worker_id = %self.id, "worker stopped");
    }

    /// Waits up to the dequeue timeout for one job and processes it.
    /// Returns whether a job was handled.
    pub async fn run_once(&self) -> Result<bool> {
        match self.queue.dequeue(&self.id, self.cfg.dequeue_timeout).await? {
            Some(lease) => {
                self.process(lease).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn process(&self, lease: Lease) -> Result<()> {
        let span = tracing::info_span!(
            "job",
            job_id = %lease.job_id(),
            job_type = %lease.job().job_type,
            attempt = lease.attempt(),
            worker_id = %self.id,
        );
        self.process_leased(lease).instrument(span).await
    }

    async fn process_leased(&self, mut lease: Lease) -> Result<()> {
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        let job = lease.job().clone();
        let ctx = JobContext {
            job_id: job.id,
            job_type: job.job_type.clone(),
            attempt: lease.attempt(),
            worker_id: self.id.clone(),
        };
        let started = Instant::now();

        let body = async {
            match self.registry.handler_for(&job.job_type) {
                Some(entry) => entry.run(job.payload.clone(), ctx).await,
                None => Err(JobError::new(
                    ErrorCode::UnknownJobType.as_str(),
                    format!("no handler for job_type={}", job.job_type),
                )),
            }
        };
        tokio::pin!(body);

        let mut ticker =
            tokio::time::interval(self.cfg.heartbeat_interval.max(Duration::from_millis(10)));
        ticker.tick().await;

        let delivery = loop {
            tokio::select! {
                res = &mut body => break Delivery::Done(res),
                _ = ticker.tick() => match self.queue.heartbeat(&mut lease).await {
                    Ok(()) => {}
                    Err(Error::LeaseLost(_)) => break Delivery::LeaseLost,
                    Err(e) => tracing::warn!(error = %e, "heartbeat failed"),
                },
            }
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        let result = match delivery {
            Delivery::Done(result) => result,
            Delivery::LeaseLost => {
                self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(latency_ms, "lease lost mid-run, abandoning job");
                return Ok(());
            }
        };

        let written = match result {
            Ok(value) => {
                let written = self.runner.on_success(&lease, value).await?;
                if written {
                    self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(latency_ms, "job finished");
                }
                written
            }
            Err(err) => {
                let written = self.runner.on_failure(&lease, &err).await?;
                if written {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(code = err.code, message = %err.message, latency_ms, "job failed");
                }
                written
            }
        };

        if !written {
            self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
