// tests/status.rs
mod common;

use common::{queue_config, Harness};

use jobflow::jobs::{JobState, NewJob, QueueConfig, ResultOutcome, StatusOutcome};
use jobflow::ErrorKind;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

fn short_retention() -> QueueConfig {
    QueueConfig {
        result_ttl: Duration::from_millis(50),
        failure_ttl: Duration::from_secs(10),
        ..queue_config(Duration::from_secs(30), 3)
    }
}

#[tokio::test]
async fn running_job_reports_running_and_has_no_result() {
    let h = Harness::default_config();
    let job_id = h
        .dispatcher
        .submit(NewJob::new("process_job", json!({})))
        .await
        .unwrap();
    let _lease = h.queue.dequeue("w1", Duration::from_millis(100)).await.unwrap().unwrap();

    assert_eq!(
        h.status.get_status(job_id).await.unwrap(),
        StatusOutcome::Found(JobState::Running)
    );
    assert_eq!(
        h.status.get_result(job_id).await.unwrap(),
        ResultOutcome::Pending(JobState::Running)
    );
}

#[tokio::test]
async fn finished_results_expire_after_retention() {
    let h = Harness::new(short_retention());
    let worker = h.worker("w1", Duration::from_secs(10));
    let job_id = h
        .dispatcher
        .submit(NewJob::new("process_job", json!({"x": 1})))
        .await
        .unwrap();
    worker.run_once().await.unwrap();

    assert!(matches!(
        h.status.get_result(job_id).await.unwrap(),
        ResultOutcome::Finished(_)
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        h.status.get_status(job_id).await.unwrap(),
        StatusOutcome::NotFoundOrExpired
    );
    assert_eq!(
        h.status.get_result(job_id).await.unwrap(),
        ResultOutcome::NotFoundOrExpired
    );
}

#[tokio::test]
async fn failures_are_retained_longer_than_results() {
    let h = Harness::new(short_retention());
    let worker = h.worker("w1", Duration::from_secs(10));
    let ok = h
        .dispatcher
        .submit(NewJob::new("process_job", json!({})))
        .await
        .unwrap();
    let failed = h
        .dispatcher
        .submit(NewJob::new("fail_me", json!({})))
        .await
        .unwrap();
    worker.run_once().await.unwrap();
    worker.run_once().await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        h.status.get_status(ok).await.unwrap(),
        StatusOutcome::NotFoundOrExpired
    );
    match h.status.get_result(failed).await.unwrap() {
        ResultOutcome::Failed(failure) => assert_eq!(failure.message, "simulated failure"),
        other => panic!("expected retained failure, got {other:?}"),
    }

    let record = h.repo.get_job(failed).await.unwrap().unwrap().record;
    let retained = record.expires_at.unwrap() - record.finished_at.unwrap();
    assert_eq!(retained, chrono::Duration::seconds(10));
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let h = Harness::default_config();
    assert_eq!(
        h.status.get_status(Uuid::new_v4()).await.unwrap(),
        StatusOutcome::NotFoundOrExpired
    );
    assert_eq!(
        h.status.get_result(Uuid::nil()).await.unwrap(),
        ResultOutcome::NotFoundOrExpired
    );
}

#[tokio::test]
async fn reads_retry_through_transient_store_errors() {
    let h = Harness::default_config();
    let job_id = h
        .dispatcher
        .submit(NewJob::new("process_job", json!({})))
        .await
        .unwrap();

    h.store.fail_next(2);
    assert_eq!(
        h.status.get_status(job_id).await.unwrap(),
        StatusOutcome::Found(JobState::Queued)
    );
}

#[tokio::test]
async fn unreachable_store_is_reported_as_store_unavailable() {
    let h = Harness::default_config();
    h.store.set_offline(true);

    let err = h.status.get_status(Uuid::new_v4()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);

    let err = h
        .dispatcher
        .submit(NewJob::new("process_job", json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
}
