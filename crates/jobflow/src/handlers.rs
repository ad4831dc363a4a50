//! Job types shipped with jobflow. The worker binary runs them and the
//! producers (API, `jobflowctl`) validate submissions against the same registry.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::jobs::registry::{boxed, HandlerOptions, HandlerRegistry, JobError};

pub const PROCESS_JOB: &str = "process_job";
pub const FAIL_ME: &str = "fail_me";

pub fn build_registry(process_job_delay: Duration) -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    register_builtins(&mut registry, process_job_delay);
    Arc::new(registry)
}

pub fn register_builtins(registry: &mut HandlerRegistry, process_job_delay: Duration) {
    // Simulated slow task: echoes its input after the delay.
    registry.register(PROCESS_JOB, move |data: Map<String, Value>, ctx| {
        boxed(async move {
            let input = Value::Object(data.clone());
            tracing::info!(job_id = %ctx.job_id, %input, "starting job");
            tokio::time::sleep(process_job_delay).await;
            tracing::info!(job_id = %ctx.job_id, "job completed");
            Ok(json!({ "status": "done", "input": data }))
        })
    });

    // Always raises; `message` in the payload overrides the error text.
    registry.register_with_options(
        FAIL_ME,
        |data: Value, _ctx| {
            boxed(async move {
                let message = data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("simulated failure")
                    .to_string();
                Err(JobError::raised(message))
            })
        },
        HandlerOptions::new().timeout(Duration::from_secs(5)),
    );
}
