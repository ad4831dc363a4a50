use jobflow::api::models::ErrorDetail;
use jobflow::config::Config;
use jobflow::jobs::{
    Dispatcher, JobsRepo, NewJob, Queue, Reaper, ResultOutcome, StatusOutcome, StatusService,
};
use jobflow::store::{PgStore, StoreHandle};
use jobflow::{db, handlers, telemetry};
use serde_json::{json, Value};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const USAGE: &str = "jobflowctl <command>\n\
     Commands:\n\
     - submit <job_type> [payload_json] [max_attempts]\n\
     - status <job_id>\n\
     - result <job_id>\n\
     - depth\n\
     - reap\n\
     - purge [batch]\n\
     - migrate\n\
     \n\
     Uses JOBFLOW_DATABASE_URL or DATABASE_URL.\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();
    let args: Vec<String> = env::args().collect();

    let Some(command) = args.get(1) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    let cfg = Config::from_env()?;
    let pool = db::make_pool(&cfg.database_url, &cfg.pool).await?;
    let pg = PgStore::new(pool.clone());
    let store: StoreHandle = Arc::new(pg.clone());
    let repo = JobsRepo::new(store, cfg.namespace.clone());
    let queue = Queue::new(repo.clone(), cfg.queue_config());

    match command.as_str() {
        "submit" => {
            let job_type = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("usage: jobflowctl submit <job_type> [payload_json] [max_attempts]"))?;
            let payload: Value = match args.get(3) {
                Some(raw) => serde_json::from_str(raw)?,
                None => json!({}),
            };
            let mut job = NewJob::new(job_type.as_str(), payload);
            if let Some(raw) = args.get(4) {
                job = job.with_max_attempts(raw.parse()?);
            }

            let registry = handlers::build_registry(Duration::from_millis(cfg.process_job_delay_ms));
            let dispatcher = Dispatcher::new(queue, registry, cfg.dispatcher_config());
            let job_id = dispatcher.submit(job).await?;
            print_json(&json!({ "job_id": job_id }))?;
        }
        "status" => {
            let job_id = parse_id(args.get(2))?;
            let status = StatusService::new(repo, cfg.store_retry.clone());
            match status.get_status(job_id).await? {
                StatusOutcome::Found(state) => print_json(&json!({ "job_id": job_id, "state": state }))?,
                StatusOutcome::NotFoundOrExpired => not_found(job_id),
            }
        }
        "result" => {
            let job_id = parse_id(args.get(2))?;
            let status = StatusService::new(repo, cfg.store_retry.clone());
            match status.get_result(job_id).await? {
                ResultOutcome::Finished(result) => {
                    print_json(&json!({ "job_id": job_id, "state": "FINISHED", "result": result }))?
                }
                ResultOutcome::Failed(failure) => print_json(&json!({
                    "job_id": job_id,
                    "state": "FAILED",
                    "error": ErrorDetail::from(failure),
                }))?,
                ResultOutcome::Pending(state) => print_json(&json!({ "job_id": job_id, "state": state }))?,
                ResultOutcome::NotFoundOrExpired => not_found(job_id),
            }
        }
        "depth" => {
            let depth = queue.depth().await?;
            print_json(&json!({ "queue": queue.name(), "depth": depth }))?;
        }
        "reap" => {
            let reaper = Reaper::new(queue, cfg.reap_batch_size);
            let report = reaper.reap_once().await?;
            print_json(&serde_json::to_value(report)?)?;
        }
        "purge" => {
            let batch: i64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(1_000);
            let deleted = pg.purge_expired(batch).await?;
            print_json(&json!({ "purged": deleted }))?;
        }
        "migrate" => {
            db::run_migrations(&pool).await?;
            println!("migrations OK");
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn parse_id(raw: Option<&String>) -> anyhow::Result<Uuid> {
    let raw = raw.ok_or_else(|| anyhow::anyhow!("a job id is required"))?;
    Ok(raw.parse()?)
}

fn not_found(job_id: Uuid) -> ! {
    eprintln!("{}", json!({ "job_id": job_id, "error": "Job not found or expired" }));
    std::process::exit(1);
}

fn print_json(v: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}
