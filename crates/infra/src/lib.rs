//! Infrastructure layer: configuration, storage, the job queue, external
//! collaborators, and the services that drive follow-up calls.
//!
//! - `dispatcher`: periodic due-task scan feeding the job queue
//! - `worker`: exclusive claim and dialing of one task
//! - `reconciler`: provider webhook ingestion and transcript persistence

pub mod call_store;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod external;
pub mod jobs;
pub mod reconciler;
pub mod task_store;
pub mod worker;

pub use config::{ConfigError, Settings};
pub use dispatcher::{DispatchError, DispatchReport, Dispatcher, DispatcherHandle};
pub use reconciler::{AckStatus, AnalyzeCallHandler, Correlation, ReconcileError, WebhookAck, WebhookReconciler};
pub use worker::{ExecutionOutcome, ExecutionWorker, WorkerError};
