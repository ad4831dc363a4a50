use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::{collections::HashMap, fmt, future::Future, pin::Pin, sync::Arc, time::Duration};
use tokio::{sync::Semaphore, task::JoinHandle, time::timeout};
use uuid::Uuid;

use crate::error::Error;
use crate::jobs::error_codes::ErrorCode;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type HandlerFn = dyn Fn(Value, JobContext) -> BoxFuture<'static, Result<Value, JobError>> + Send + Sync;
type ValidateFn = dyn Fn(&Value) -> Result<(), String> + Send + Sync;

/// Failure reported by a job body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    pub code: &'static str,
    pub message: String,
}

impl JobError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Generic failure raised by handler code.
    pub fn raised(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::HandlerError.as_str(), message)
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for JobError {}

/// What a handler knows about the delivery it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub job_type: String,
    pub attempt: u32,
    pub worker_id: String,
}

#[derive(Clone)]
pub struct HandlerEntry {
    handler: Arc<HandlerFn>,
    validate: Arc<ValidateFn>,
    pub semaphore: Option<Arc<Semaphore>>,
    pub timeout: Option<Duration>,
}

/// Job type name to typed handler. Producers and workers share one registry,
/// so a payload accepted at submit time is one the handler can decode.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P, F>(&mut self, job_type: &str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, JobContext) -> BoxFuture<'static, Result<Value, JobError>> + Send + Sync + 'static,
    {
        self.register_with_options(job_type, handler, HandlerOptions::new());
    }

    pub fn register_with_timeout<P, F>(&mut self, job_type: &str, handler: F, timeout_dur: Duration)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, JobContext) -> BoxFuture<'static, Result<Value, JobError>> + Send + Sync + 'static,
    {
        self.register_with_options(job_type, handler, HandlerOptions::new().timeout(timeout_dur));
    }

    pub fn register_with_options<P, F>(&mut self, job_type: &str, handler: F, opts: HandlerOptions)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, JobContext) -> BoxFuture<'static, Result<Value, JobError>> + Send + Sync + 'static,
    {
        let semaphore = opts
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        let run = move |payload: Value, ctx: JobContext| match serde_json::from_value::<P>(payload) {
            Ok(decoded) => handler(decoded, ctx),
            Err(e) => boxed(async move {
                Err(JobError::new(ErrorCode::BadPayload.as_str(), e.to_string()))
            }),
        };
        let validate = |payload: &Value| {
            P::deserialize(payload)
                .map(|_| ())
                .map_err(|e| e.to_string())
        };

        self.handlers.insert(
            job_type.to_string(),
            HandlerEntry {
                handler: Arc::new(run),
                validate: Arc::new(validate),
                semaphore,
                timeout: opts.timeout,
            },
        );
    }

    pub fn handler_for(&self, job_type: &str) -> Option<HandlerEntry> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Submit-time check: the type is registered and the payload decodes.
    pub fn validate(&self, job_type: &str, payload: &Value) -> Result<(), Error> {
        let entry = self
            .handlers
            .get(job_type)
            .ok_or_else(|| Error::validation(format!("unknown job type '{job_type}'")))?;
        (entry.validate)(payload)
            .map_err(|e| Error::validation(format!("payload rejected by '{job_type}': {e}")))
    }
}

#[derive(Clone, Debug, Default)]
pub struct HandlerOptions {
    max_concurrency: Option<usize>,
    timeout: Option<Duration>,
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    pub fn timeout(mut self, dur: Duration) -> Self {
        self.timeout = Some(dur);
        self
    }
}

impl HandlerEntry {
    /// Runs the body on its own task so a panic becomes a `PANIC` failure
    /// instead of taking the worker down.
    pub async fn run(&self, payload: Value, ctx: JobContext) -> Result<Value, JobError> {
        let _permit = match &self.semaphore {
            Some(sem) => Some(sem.clone().acquire_owned().await.map_err(|_| {
                JobError::new(ErrorCode::DependencyDown.as_str(), "handler semaphore closed")
            })?),
            None => None,
        };

        let mut task = AbortOnDrop(tokio::spawn((self.handler)(payload, ctx)));
        let joined = match self.timeout {
            Some(dur) => match timeout(dur, &mut task.0).await {
                Ok(joined) => joined,
                Err(_) => {
                    return Err(JobError::new(
                        ErrorCode::Timeout.as_str(),
                        format!("handler timeout after {}ms", dur.as_millis()),
                    ));
                }
            },
            None => (&mut task.0).await,
        };

        match joined {
            Ok(res) => res,
            Err(e) if e.is_panic() => Err(JobError::new(
                ErrorCode::Panic.as_str(),
                panic_message(e.into_panic()),
            )),
            Err(e) => Err(JobError::new(ErrorCode::Unknown.as_str(), e.to_string())),
        }
    }
}

/// Aborts the spawned body when the caller stops waiting for it (timeout or
/// an abandoned delivery), so it never outlives its permit.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "job body panicked".to_string()
    }
}

pub fn boxed<'a, T>(fut: impl Future<Output = T> + Send + 'a) -> BoxFuture<'a, T> {
    Box::pin(fut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    fn ctx() -> JobContext {
        JobContext {
            job_id: Uuid::new_v4(),
            job_type: "add".into(),
            attempt: 1,
            worker_id: "w1".into(),
        }
    }

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register("add", |p: Add, _ctx| boxed(async move { Ok(json!(p.a + p.b)) }));
        registry.register("explode", |payload: Value, _ctx| {
            boxed(async move {
                if payload.get("x").is_none() {
                    panic!("kaboom");
                }
                Ok(payload)
            })
        });
        registry.register_with_timeout(
            "slow",
            |_: Value, _ctx| {
                boxed(async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Value::Null)
                })
            },
            Duration::from_millis(20),
        );
        registry
    }

    #[tokio::test]
    async fn typed_handlers_decode_their_payload() {
        let entry = registry().handler_for("add").unwrap();
        assert_eq!(entry.run(json!({"a": 2, "b": 3}), ctx()).await, Ok(json!(5)));

        let err = entry.run(json!({"a": "two"}), ctx()).await.unwrap_err();
        assert_eq!(err.code, "BAD_PAYLOAD");
    }

    #[tokio::test]
    async fn panics_and_timeouts_become_failures() {
        let registry = registry();

        let err = registry.handler_for("explode").unwrap().run(json!({}), ctx()).await.unwrap_err();
        assert_eq!(err.code, "PANIC");
        assert!(err.message.contains("kaboom"));

        let err = registry.handler_for("slow").unwrap().run(json!({}), ctx()).await.unwrap_err();
        assert_eq!(err.code, "TIMEOUT");
    }

    #[test]
    fn validate_rejects_unknown_types_and_bad_payloads() {
        let registry = registry();
        assert!(registry.validate("add", &json!({"a": 1, "b": 2})).is_ok());
        assert!(matches!(
            registry.validate("add", &json!({"a": 1})),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            registry.validate("nope", &json!({})),
            Err(Error::Validation(_))
        ));
        assert_eq!(registry.job_types(), vec!["add", "explode", "slow"]);
    }

    #[tokio::test]
    async fn dropping_a_run_stops_the_body() {
        let done = Arc::new(AtomicBool::new(false));
        let mut registry = HandlerRegistry::new();
        let flag = done.clone();
        registry.register_with_options(
            "slow_mark",
            move |_: Value, _ctx| {
                let flag = flag.clone();
                boxed(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(Value::Null)
                })
            },
            HandlerOptions::new().max_concurrency(1),
        );
        let entry = registry.handler_for("slow_mark").unwrap();

        let abandoned = timeout(Duration::from_millis(20), entry.run(json!({}), ctx())).await;
        assert!(abandoned.is_err());

        // the permit is free again and the first body never finished
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!done.load(Ordering::SeqCst));
        assert_eq!(entry.semaphore.as_ref().unwrap().available_permits(), 1);
    }
}
