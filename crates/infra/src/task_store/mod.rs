//! Durable storage for follow-up tasks.
//!
//! The store owns the exclusive claim: `claim` moves a task to `in_progress`
//! under a row lock that is never waited on. Everything after the claim
//! (directory lookups, dialing) happens outside the lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use dialback_core::{DomainError, TaskId};
use dialback_followups::{Eligibility, FollowUpTask, TaskStatus};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskStoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result of an exclusive claim attempt.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The caller owns the execution; the task is now `in_progress`.
    Claimed(FollowUpTask),
    /// Another worker holds the row or is already executing the task.
    Locked,
    /// The task changed since it was enqueued and must not run now.
    NotEligible(Eligibility),
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: &FollowUpTask) -> Result<(), TaskStoreError>;

    async fn get(&self, id: TaskId) -> Result<Option<FollowUpTask>, TaskStoreError>;

    /// Most recently created first.
    async fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<FollowUpTask>, TaskStoreError>;

    /// Due, not completed, callable and pending/scheduled; highest priority
    /// then earliest due first.
    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<FollowUpTask>, TaskStoreError>;

    /// Move the given tasks from pending to scheduled. Returns how many moved.
    async fn mark_scheduled(&self, ids: &[TaskId], now: DateTime<Utc>) -> Result<u64, TaskStoreError>;

    /// Non-blocking exclusive claim.
    async fn claim(&self, id: TaskId, now: DateTime<Utc>) -> Result<ClaimOutcome, TaskStoreError>;

    /// Overwrite the task's mutable state. Last writer wins.
    async fn save(&self, task: &FollowUpTask) -> Result<(), TaskStoreError>;

    /// Overwrite the task only while the stored row is still the `in_progress`
    /// claim taken at `claimed_at`. Returns `false` when the claim is gone
    /// (cancelled, reclaimed or finished elsewhere) and nothing was written.
    async fn save_if_claimed(&self, task: &FollowUpTask, claimed_at: DateTime<Utc>) -> Result<bool, TaskStoreError>;

    /// Return every `in_progress` task claimed before `cutoff` to pending.
    async fn reap_expired_claims(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, TaskStoreError>;

    /// Cancel a non-terminal task.
    async fn cancel(&self, id: TaskId, now: DateTime<Utc>) -> Result<FollowUpTask, TaskStoreError>;

    /// Pull `due_at` forward to `now` for a waiting task.
    async fn make_due(&self, id: TaskId, now: DateTime<Utc>) -> Result<FollowUpTask, TaskStoreError>;

    /// Merge an enrichment map into the stored context, key by key.
    async fn enrich_context(
        &self,
        id: TaskId,
        enrichment: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<FollowUpTask, TaskStoreError>;
}

/// Claim decision shared by both stores once the row is held.
pub(crate) fn decide_claim(task: &mut FollowUpTask, now: DateTime<Utc>) -> Result<Option<ClaimOutcome>, DomainError> {
    match task.eligibility(now) {
        Eligibility::Eligible => {
            task.begin_execution(now)?;
            Ok(None)
        }
        Eligibility::InProgress => Ok(Some(ClaimOutcome::Locked)),
        other => Ok(Some(ClaimOutcome::NotEligible(other))),
    }
}
