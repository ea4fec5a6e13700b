//! In-memory task store for tests/dev.
//!
//! The map mutex plays the role of the row lock: a claim checks and flips the
//! status in one critical section, so a second concurrent claim observes
//! `in_progress` and reports `Locked`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use dialback_core::TaskId;
use dialback_followups::{FollowUpTask, TaskStatus};

use super::{ClaimOutcome, TaskStore, TaskStoreError, decide_claim};

#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<HashMap<TaskId, FollowUpTask>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn with_task<T>(
        &self,
        id: TaskId,
        f: impl FnOnce(&mut FollowUpTask) -> Result<T, TaskStoreError>,
    ) -> Result<T, TaskStoreError> {
        let mut tasks = self.tasks.lock()?;
        let task = tasks.get_mut(&id).ok_or(TaskStoreError::NotFound(id))?;
        // Mutate a copy so a failed transition leaves the stored task untouched.
        let mut working = task.clone();
        let out = f(&mut working)?;
        *task = working;
        Ok(out)
    }
}

impl<T> From<PoisonError<T>> for TaskStoreError {
    fn from(_: PoisonError<T>) -> Self {
        TaskStoreError::Storage("task store lock poisoned".to_string())
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: &FollowUpTask) -> Result<(), TaskStoreError> {
        let mut tasks = self.tasks.lock()?;
        if tasks.contains_key(&task.id) {
            return Err(TaskStoreError::AlreadyExists(task.id));
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<FollowUpTask>, TaskStoreError> {
        Ok(self.tasks.lock()?.get(&id).cloned())
    }

    async fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<FollowUpTask>, TaskStoreError> {
        let tasks = self.tasks.lock()?;
        let mut out: Vec<_> = tasks
            .values()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out.truncate(limit);
        Ok(out)
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<FollowUpTask>, TaskStoreError> {
        let tasks = self.tasks.lock()?;
        let mut due: Vec<_> = tasks
            .values()
            .filter(|t| {
                !t.completed && t.status.is_dispatchable() && t.channel.is_callable() && t.due_at <= now
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            b.priority
                .rank()
                .cmp(&a.priority.rank())
                .then(a.due_at.cmp(&b.due_at))
                .then(a.id.cmp(&b.id))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_scheduled(&self, ids: &[TaskId], now: DateTime<Utc>) -> Result<u64, TaskStoreError> {
        let mut tasks = self.tasks.lock()?;
        let mut moved = 0;
        for id in ids {
            if let Some(task) = tasks.get_mut(id) {
                if task.status == TaskStatus::Pending && !task.completed {
                    task.mark_scheduled(now)?;
                    moved += 1;
                }
            }
        }
        Ok(moved)
    }

    async fn claim(&self, id: TaskId, now: DateTime<Utc>) -> Result<ClaimOutcome, TaskStoreError> {
        self.with_task(id, |task| match decide_claim(task, now)? {
            Some(outcome) => Ok(outcome),
            None => Ok(ClaimOutcome::Claimed(task.clone())),
        })
    }

    async fn save(&self, task: &FollowUpTask) -> Result<(), TaskStoreError> {
        let mut tasks = self.tasks.lock()?;
        match tasks.get_mut(&task.id) {
            Some(stored) => {
                *stored = task.clone();
                Ok(())
            }
            None => Err(TaskStoreError::NotFound(task.id)),
        }
    }

    async fn save_if_claimed(&self, task: &FollowUpTask, claimed_at: DateTime<Utc>) -> Result<bool, TaskStoreError> {
        let mut tasks = self.tasks.lock()?;
        let stored = tasks.get_mut(&task.id).ok_or(TaskStoreError::NotFound(task.id))?;
        if stored.status != TaskStatus::InProgress || stored.claimed_at != Some(claimed_at) {
            return Ok(false);
        }
        *stored = task.clone();
        Ok(true)
    }

    async fn reap_expired_claims(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, TaskStoreError> {
        let mut tasks = self.tasks.lock()?;
        let mut reaped = Vec::new();
        for task in tasks.values_mut().filter(|t| t.claim_expired(cutoff)) {
            task.release_expired_claim(now)?;
            reaped.push(task.id);
        }
        reaped.sort();
        Ok(reaped)
    }

    async fn cancel(&self, id: TaskId, now: DateTime<Utc>) -> Result<FollowUpTask, TaskStoreError> {
        self.with_task(id, |task| {
            task.cancel(now)?;
            Ok(task.clone())
        })
    }

    async fn make_due(&self, id: TaskId, now: DateTime<Utc>) -> Result<FollowUpTask, TaskStoreError> {
        self.with_task(id, |task| {
            task.pull_due_forward(now)?;
            Ok(task.clone())
        })
    }

    async fn enrich_context(
        &self,
        id: TaskId,
        enrichment: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<FollowUpTask, TaskStoreError> {
        self.with_task(id, |task| {
            task.enrich(enrichment, now);
            Ok(task.clone())
        })
    }
}
