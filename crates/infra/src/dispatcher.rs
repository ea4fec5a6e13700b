//! Periodic due-task scan.
//!
//! The dispatcher takes no locks. It may enqueue a task that a worker already
//! owns, or enqueue the same task twice across ticks; the worker's claim step
//! turns every duplicate into a skip.
//!
//! Each scan first returns claims older than the claim timeout to pending, so a
//! worker that died mid-execution does not strand its task in `in_progress`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use dialback_core::TaskId;

use crate::jobs::{Job, JobKind, JobStore, JobStoreError, RetryPolicy};
use crate::task_store::{TaskStore, TaskStoreError};

/// Finished jobs older than this many hours are dropped from the in-memory queue.
const FINISHED_JOB_RETENTION_HOURS: i64 = 1;

/// Dead letters older than this many hours are dropped.
const DEAD_LETTER_RETENTION_HOURS: i64 = 24 * 7;

/// Claims older than this are treated as abandoned.
pub const DEFAULT_CLAIM_TIMEOUT_SECS: i64 = 600;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Tasks(#[from] TaskStoreError),
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Abandoned `in_progress` claims returned to pending.
    pub reclaimed: usize,
    /// Due tasks returned by the scan.
    pub found: usize,
    /// Tasks moved from pending to scheduled.
    pub scheduled: u64,
    pub enqueued: usize,
}

/// Execution job for one task.
///
/// Job-level retries only cover infrastructure failures (store errors).
/// Dialer failures are retried by the worker's own policy.
pub fn execute_job(task_id: TaskId) -> Job {
    Job::new(JobKind::ExecuteFollowUp { task_id }).with_retry_policy(RetryPolicy::exponential(
        3,
        Duration::from_secs(1),
        Duration::from_secs(30),
    ))
}

pub struct Dispatcher {
    tasks: Arc<dyn TaskStore>,
    jobs: Arc<dyn JobStore>,
    batch_size: usize,
    claim_timeout: chrono::Duration,
}

impl Dispatcher {
    pub fn new(tasks: Arc<dyn TaskStore>, jobs: Arc<dyn JobStore>, batch_size: usize) -> Self {
        Self {
            tasks,
            jobs,
            batch_size: batch_size.max(1),
            claim_timeout: chrono::Duration::seconds(DEFAULT_CLAIM_TIMEOUT_SECS),
        }
    }

    pub fn with_claim_timeout(mut self, claim_timeout: chrono::Duration) -> Self {
        self.claim_timeout = claim_timeout;
        self
    }

    /// One scan: reclaim abandoned claims, mark due pending tasks scheduled
    /// and enqueue an execution job for every due task.
    pub async fn process_due(&self, now: DateTime<Utc>) -> Result<DispatchReport, DispatchError> {
        let reclaimed = self.reap_expired_claims(now).await?;

        let due = self.tasks.find_due(now, self.batch_size).await?;
        if due.is_empty() {
            return Ok(DispatchReport {
                reclaimed,
                ..DispatchReport::default()
            });
        }

        let ids: Vec<TaskId> = due.iter().map(|t| t.id).collect();
        let scheduled = self.tasks.mark_scheduled(&ids, now).await?;

        let mut enqueued = 0;
        for id in &ids {
            self.jobs.enqueue(execute_job(*id))?;
            enqueued += 1;
        }

        Ok(DispatchReport {
            reclaimed,
            found: due.len(),
            scheduled,
            enqueued,
        })
    }

    async fn reap_expired_claims(&self, now: DateTime<Utc>) -> Result<usize, DispatchError> {
        let cutoff = now.checked_sub_signed(self.claim_timeout).unwrap_or(now);
        let reaped = self.tasks.reap_expired_claims(cutoff, now).await?;
        for task_id in &reaped {
            warn!(task_id = %task_id, claim_timeout_secs = self.claim_timeout.num_seconds(), "claim expired; task returned to pending");
        }
        Ok(reaped.len())
    }

    /// Run `process_due` every `interval` until shutdown.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move { self.run(interval, shutdown_rx).await });
        DispatcherHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), batch_size = self.batch_size, "dispatcher started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            let now = Utc::now();
            match self.process_due(now).await {
                Ok(report) if report.enqueued > 0 || report.reclaimed > 0 => {
                    info!(
                        reclaimed = report.reclaimed,
                        found = report.found,
                        scheduled = report.scheduled,
                        enqueued = report.enqueued,
                        "dispatched due tasks"
                    );
                }
                Ok(_) => debug!("no due tasks"),
                Err(e) => error!(error = %e, "dispatch tick failed"),
            }

            match self.jobs.prune_finished(now - chrono::Duration::hours(FINISHED_JOB_RETENTION_HOURS)) {
                Ok(0) => {}
                Ok(pruned) => debug!(pruned, "pruned finished jobs"),
                Err(e) => error!(error = %e, "failed to prune finished jobs"),
            }

            match self.jobs.prune_dead_letters(now - chrono::Duration::hours(DEAD_LETTER_RETENTION_HOURS)) {
                Ok(0) => {}
                Ok(pruned) => info!(pruned, "pruned expired dead letters"),
                Err(e) => error!(error = %e, "failed to prune dead letters"),
            }
        }

        info!("dispatcher stopped");
    }
}

#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Stop the loop after the current tick.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}
