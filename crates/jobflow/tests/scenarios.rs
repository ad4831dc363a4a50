// tests/scenarios.rs
mod common;

use common::Harness;

use jobflow::jobs::{JobRecord, JobState, NewJob, ResultOutcome, StatusOutcome};
use jobflow::ErrorKind;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
async fn submitted_job_is_queued_then_finishes_with_echoed_input() {
    let h = Harness::default_config();
    let worker = h.worker("worker-a", Duration::from_secs(10));

    let job_id = h
        .dispatcher
        .submit(NewJob::new("process_job", json!({"x": 1})))
        .await
        .unwrap();

    assert_eq!(
        h.status.get_status(job_id).await.unwrap(),
        StatusOutcome::Found(JobState::Queued)
    );
    assert_eq!(
        h.status.get_result(job_id).await.unwrap(),
        ResultOutcome::Pending(JobState::Queued)
    );

    assert!(worker.run_once().await.unwrap());

    assert_eq!(
        h.status.get_status(job_id).await.unwrap(),
        StatusOutcome::Found(JobState::Finished)
    );
    assert_eq!(
        h.status.get_result(job_id).await.unwrap(),
        ResultOutcome::Finished(json!({"status": "done", "input": {"x": 1}}))
    );

    let record = h.repo.get_job(job_id).await.unwrap().unwrap().record;
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.lease_owner.as_deref(), Some("worker-a"));
    assert!(record.error.is_none());
    assert!(record.created_at <= record.started_at.unwrap());
    assert!(record.started_at <= record.finished_at);
}

#[tokio::test]
async fn raising_body_fails_with_job_raised_and_no_result() {
    let h = Harness::default_config();
    let worker = h.worker("worker-a", Duration::from_secs(10));

    let job_id = h
        .dispatcher
        .submit(NewJob::new("fail_me", json!({"message": "bad input"})))
        .await
        .unwrap();
    worker.run_once().await.unwrap();

    match h.status.get_result(job_id).await.unwrap() {
        ResultOutcome::Failed(failure) => {
            assert_eq!(failure.kind, ErrorKind::JobRaised);
            assert_eq!(failure.code, "HANDLER_ERROR");
            assert_eq!(failure.message, "bad input");
        }
        other => panic!("expected failure, got {other:?}"),
    }

    let record = h.repo.get_job(job_id).await.unwrap().unwrap().record;
    assert_eq!(record.state, JobState::Failed);
    assert!(record.result.is_none());
    assert_eq!(worker.stats().failed(), 1);
}

#[tokio::test]
async fn panicking_body_is_captured_and_the_worker_keeps_going() {
    let h = Harness::default_config();
    let worker = h.worker("worker-a", Duration::from_secs(10));

    let boom = h
        .dispatcher
        .submit(NewJob::new("explode", json!({})))
        .await
        .unwrap();
    let fine = h
        .dispatcher
        .submit(NewJob::new("explode", json!({"defuse": true})))
        .await
        .unwrap();

    assert!(worker.run_once().await.unwrap());
    assert!(worker.run_once().await.unwrap());

    match h.status.get_result(boom).await.unwrap() {
        ResultOutcome::Failed(failure) => {
            assert_eq!(failure.kind, ErrorKind::JobRaised);
            assert_eq!(failure.code, "PANIC");
            assert!(failure.message.contains("kaboom"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(
        h.status.get_result(fine).await.unwrap(),
        ResultOutcome::Finished(json!({"defuse": true}))
    );
}

#[tokio::test]
async fn handler_error_codes_are_kept() {
    let h = Harness::default_config();
    let worker = h.worker("worker-a", Duration::from_secs(10));

    let job_id = h
        .dispatcher
        .submit(NewJob::new("refuse", json!({})))
        .await
        .unwrap();
    worker.run_once().await.unwrap();

    match h.status.get_result(job_id).await.unwrap() {
        ResultOutcome::Failed(failure) => {
            assert_eq!(failure.kind, ErrorKind::JobRaised);
            assert_eq!(failure.code, "DEPENDENCY_DOWN");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn records_for_unregistered_types_fail_instead_of_looping() {
    let h = Harness::default_config();
    let worker = h.worker("worker-a", Duration::from_secs(10));

    // Written by a producer that knows a type this worker doesn't.
    let job_id = Uuid::new_v4();
    let record = JobRecord::queued(job_id, "default", NewJob::new("resize_image", json!({})), 3);
    h.repo.insert(&record).await.unwrap().unwrap();
    h.queue.enqueue(job_id).await.unwrap();

    worker.run_once().await.unwrap();

    match h.status.get_result(job_id).await.unwrap() {
        ResultOutcome::Failed(failure) => assert_eq!(failure.code, "UNKNOWN_JOB_TYPE"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(h.queue.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn status_of_unknown_id_is_not_found() {
    let h = Harness::default_config();
    let missing = Uuid::new_v4();

    assert_eq!(
        h.status.get_status(missing).await.unwrap(),
        StatusOutcome::NotFoundOrExpired
    );
    assert_eq!(
        h.status.get_result(missing).await.unwrap(),
        ResultOutcome::NotFoundOrExpired
    );
}

#[tokio::test]
async fn outcome_write_rides_out_transient_store_failures() {
    let h = Harness::default_config();
    let worker = h.worker("worker-a", Duration::from_secs(10));

    let job_id = h
        .dispatcher
        .submit(NewJob::new("flaky_store", json!(2)))
        .await
        .unwrap();
    assert!(worker.run_once().await.unwrap());

    assert_eq!(
        h.status.get_result(job_id).await.unwrap(),
        ResultOutcome::Finished(json!("survived"))
    );
    assert_eq!(worker.stats().succeeded(), 1);
}

#[tokio::test]
async fn results_are_stable_once_terminal() {
    let h = Harness::default_config();
    let worker_a = h.worker("worker-a", Duration::from_secs(10));
    let worker_b = h.worker("worker-b", Duration::from_secs(10));

    let job_id = h
        .dispatcher
        .submit(NewJob::new("process_job", json!({"n": 7})))
        .await
        .unwrap();
    worker_a.run_once().await.unwrap();

    let first = h.status.get_result(job_id).await.unwrap();
    // nothing is left to deliver, and a reaper pass changes nothing
    assert!(!worker_b.run_once().await.unwrap());
    assert!(h.reaper().reap_once().await.unwrap().is_empty());

    assert_eq!(h.status.get_result(job_id).await.unwrap(), first);
    assert_eq!(
        h.status.get_status(job_id).await.unwrap(),
        StatusOutcome::Found(JobState::Finished)
    );
}
