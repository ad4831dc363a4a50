#![allow(dead_code)]

use jobflow::handlers::register_builtins;
use jobflow::jobs::{
    boxed, Dispatcher, DispatcherConfig, HandlerRegistry, JobError, JobsRepo, Queue, QueueConfig,
    Reaper, RetryConfig, StatusService, Worker, WorkerConfig,
};
use jobflow::store::{MemoryStore, StoreHandle};
use serde_json::{json, Value};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::Arc;
use std::time::Duration;

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 4,
        base_ms: 1,
        max_ms: 5,
        jitter_pct: 0.0,
    }
}

pub fn queue_config(lease: Duration, max_attempts: u32) -> QueueConfig {
    QueueConfig {
        name: "default".to_string(),
        lease_duration: lease,
        max_attempts,
        retry: fast_retry(),
        ..QueueConfig::default()
    }
}

/// Built-in handlers (with a short `process_job` delay) plus a few test types.
pub fn test_registry(store: Arc<MemoryStore>) -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    register_builtins(&mut registry, Duration::from_millis(10));

    registry.register("explode", |payload: Value, _ctx| {
        boxed(async move {
            if payload.get("defuse").is_none() {
                panic!("kaboom");
            }
            Ok(payload)
        })
    });

    registry.register("sleep_ms", |ms: u64, ctx| {
        boxed(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({ "slept_ms": ms, "attempt": ctx.attempt }))
        })
    });

    // Knocks the store over for the next few calls, which land on the outcome write.
    registry.register("flaky_store", move |failures: usize, _ctx| {
        let store = store.clone();
        boxed(async move {
            store.fail_next(failures);
            Ok(json!("survived"))
        })
    });

    registry.register("refuse", |_: Value, _ctx| {
        boxed(async move { Err(JobError::new("DEPENDENCY_DOWN", "upstream said no")) })
    });

    Arc::new(registry)
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub repo: JobsRepo,
    pub queue: Queue,
    pub registry: Arc<HandlerRegistry>,
    pub dispatcher: Dispatcher,
    pub status: StatusService,
}

impl Harness {
    pub fn new(cfg: QueueConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let handle: StoreHandle = store.clone();
        let repo = JobsRepo::new(handle, "test");
        let queue = Queue::new(repo.clone(), cfg);
        let registry = test_registry(store.clone());
        let dispatcher = Dispatcher::new(queue.clone(), registry.clone(), DispatcherConfig::default());
        let status = StatusService::new(repo.clone(), fast_retry());
        Self {
            store,
            repo,
            queue,
            registry,
            dispatcher,
            status,
        }
    }

    pub fn default_config() -> Self {
        Self::new(queue_config(Duration::from_secs(30), 3))
    }

    pub fn worker(&self, id: &str, heartbeat: Duration) -> Worker {
        Worker::new(
            id,
            self.queue.clone(),
            self.registry.clone(),
            WorkerConfig {
                dequeue_timeout: Duration::from_millis(200),
                heartbeat_interval: heartbeat,
                retry: fast_retry(),
            },
        )
    }

    pub fn reaper(&self) -> Reaper {
        Reaper::new(self.queue.clone(), 100)
    }
}

/// Postgres-backed tests need `TEST_DATABASE_URL`; without it they are skipped.
pub async fn setup_pg() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping postgres test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query("TRUNCATE TABLE kv_entries, kv_lists, kv_indexes RESTART IDENTITY")
        .execute(&pool)
        .await
        .expect("truncate failed");

    Some(pool)
}
