pub mod dispatcher;
pub mod error_codes;
pub mod model;
pub mod queue;
pub mod reaper;
pub mod registry;
pub mod repo;
pub mod retry;
pub mod runner;
pub mod status;
pub mod worker;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use model::{JobFailure, JobRecord, JobState, NewJob, Outcome};
pub use queue::{Lease, Queue, QueueConfig};
pub use reaper::{ReapReport, Reaper};
pub use registry::{boxed, BoxFuture, HandlerOptions, HandlerRegistry, JobContext, JobError};
pub use repo::{JobsRepo, StoredJob};
pub use retry::RetryConfig;
pub use runner::JobRunner;
pub use status::{ResultOutcome, StatusOutcome, StatusService};
pub use worker::{Worker, WorkerConfig, WorkerHandle, WorkerStats};
