use jobflow::api;
use jobflow::config;
use jobflow::db;
use jobflow::handlers::build_registry;
use jobflow::jobs::{Dispatcher, JobsRepo, Queue, Reaper, StatusService, Worker};
use jobflow::store::{PgStore, StoreHandle};
use jobflow::telemetry;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();
    let cfg = config::Config::from_env()?;

    tracing::info!(
        worker_id = %cfg.worker_id,
        queue = %cfg.queue,
        lease_seconds = cfg.lease_seconds,
        heartbeat_interval_ms = cfg.heartbeat_interval_ms,
        max_attempts = cfg.max_attempts,
        concurrency = cfg.concurrency,
        reap_interval_ms = cfg.reap_interval_ms,
        api = cfg.api_addr.as_deref().unwrap_or("disabled"),
        migrate_on_startup = cfg.migrate_on_startup,
        "jobflow starting"
    );

    let pool = db::make_pool(&cfg.database_url, &cfg.pool).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let pg = PgStore::new(pool.clone());
    let store: StoreHandle = Arc::new(pg.clone());
    let repo = JobsRepo::new(store, cfg.namespace.clone());
    let queue = Queue::new(repo.clone(), cfg.queue_config());
    let registry = build_registry(Duration::from_millis(cfg.process_job_delay_ms));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    // ---- Worker loops ----
    for n in 0..cfg.concurrency {
        let worker_id = if cfg.concurrency == 1 {
            cfg.worker_id.clone()
        } else {
            format!("{}-{}", cfg.worker_id, n + 1)
        };
        let worker = Worker::new(worker_id, queue.clone(), registry.clone(), cfg.worker_config());
        let rx = shutdown_rx.clone();
        tasks.spawn(async move {
            worker.run(rx).await;
            Ok::<(), anyhow::Error>(())
        });
    }

    // ---- Reaper ----
    {
        let reaper = Reaper::new(queue.clone(), cfg.reap_batch_size);
        let interval = cfg.reap_interval();
        let rx = shutdown_rx.clone();
        tasks.spawn(async move {
            reaper.run(interval, rx).await;
            Ok(())
        });
    }

    // ---- Store maintenance ----
    {
        let pg = pg.clone();
        let interval = Duration::from_secs(cfg.purge_interval_secs.max(1));
        let mut rx = shutdown_rx.clone();
        tasks.spawn(async move {
            loop {
                match pg.purge_expired(500).await {
                    Ok(n) if n > 0 => tracing::info!(purged = n, "purged expired store entries"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "purge failed"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = rx.changed() => break,
                }
            }
            Ok(())
        });
    }

    // ---- API ----
    if let Some(addr) = cfg.api_addr.clone() {
        let state = api::ApiState {
            dispatcher: Dispatcher::new(queue.clone(), registry.clone(), cfg.dispatcher_config()),
            status: StatusService::new(repo.clone(), cfg.store_retry.clone()),
            default_job_type: cfg.default_job_type.clone(),
        };
        let app = api::router(state);
        let mut rx = shutdown_rx.clone();
        tasks.spawn(async move {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!(%addr, "api listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = rx.changed().await;
                })
                .await?;
            Ok::<(), anyhow::Error>(())
        });
    }

    let outcome: anyhow::Result<()> = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("shutdown requested, finishing jobs in hand");
            Ok(())
        }
        Some(joined) = tasks.join_next() => match joined {
            // every task runs until shutdown, so an early exit is a failure
            Ok(Ok(())) => Err(anyhow::anyhow!("background task exited unexpectedly")),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(e.into()),
        },
    };

    let _ = shutdown_tx.send(true);
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "task ended with error"),
            Err(e) => tracing::warn!(error = %e, "task join failed"),
        }
    }

    if let Err(e) = &outcome {
        tracing::error!(error = %e, "jobflow stopped on failure");
    } else {
        tracing::info!("jobflow stopped");
    }
    outcome
}
