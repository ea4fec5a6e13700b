//! Background job system with retry, backoff, and dead-letter handling.
//!
//! - `Job`: a typed unit of work (`JobKind`) plus its retry state
//! - `JobStore`: the queue (in-memory; not durable across restarts)
//! - `JobExecutor`: a pool of tokio workers routing jobs to handlers
//! - dead letters: jobs that exhausted their policy, kept for inspection/replay

pub mod executor;
pub mod store;
pub mod types;

pub use executor::{ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobHandler};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, DeadLetterEntry, Job, JobAttemptRecord, JobId, JobKind, JobResult, JobStatus,
    RetryPolicy,
};
