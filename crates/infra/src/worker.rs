//! Follow-up execution: exclusive claim, contact resolution, dialing, and the
//! retry decision on transient dialer failures.
//!
//! The claim is the only step that holds the task row. Directory lookups and
//! the dialer call run after it is released; a cancellation that lands while
//! the dialer is in flight is overwritten by a completed or failed result.
//! A retry is only written while the claim is still held, so it never
//! revives a task that was cancelled or reclaimed in the meantime.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use dialback_calls::{CallRecord, MetadataSnapshot, SnapshotSource};
use dialback_core::{CallRecordId, TaskId};
use dialback_followups::{Eligibility, FollowUpTask, merge_context};

use crate::call_store::{CallStore, CallStoreError};
use crate::dispatcher::execute_job;
use crate::external::{ContactDirectory, DialError, DialRequest, Dialer};
use crate::jobs::{Job, JobHandler, JobKind, JobResult, JobStore, JobStoreError, RetryPolicy};
use crate::task_store::{ClaimOutcome, TaskStore, TaskStoreError};

pub const NO_LINKED_TARGET: &str = "no linked target";
pub const NO_PHONE_NUMBER: &str = "target has no phone number";

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Tasks(#[from] TaskStoreError),
    #[error(transparent)]
    Calls(#[from] CallStoreError),
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
}

/// What one execution attempt did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed { call_record_id: CallRecordId },
    RetryScheduled { attempt: u32, retry_at: DateTime<Utc>, error: String },
    Failed { error: String },
    /// The task was cancelled or reclaimed mid-flight; no retry was scheduled.
    ClaimLost { error: String },
    /// Another worker holds or owns the task.
    SkippedLocked,
    SkippedNotEligible { reason: String },
}

impl ExecutionOutcome {
    fn not_eligible(eligibility: &Eligibility) -> Self {
        let reason = match eligibility {
            Eligibility::NotDispatchable(status) => format!("task is {status}"),
            Eligibility::NotDue(due_at) => format!("task is not due until {}", due_at.to_rfc3339()),
            Eligibility::NotCallable(channel) => format!("channel {} is not callable", channel.as_str()),
            Eligibility::InProgress => "task is in progress".to_string(),
            Eligibility::Eligible => "task is eligible".to_string(),
        };
        ExecutionOutcome::SkippedNotEligible { reason }
    }
}

pub struct ExecutionWorker {
    tasks: Arc<dyn TaskStore>,
    calls: Arc<dyn CallStore>,
    contacts: Arc<dyn ContactDirectory>,
    dialer: Arc<dyn Dialer>,
    jobs: Arc<dyn JobStore>,
    retry: RetryPolicy,
}

impl ExecutionWorker {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        calls: Arc<dyn CallStore>,
        contacts: Arc<dyn ContactDirectory>,
        dialer: Arc<dyn Dialer>,
        jobs: Arc<dyn JobStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            tasks,
            calls,
            contacts,
            dialer,
            jobs,
            retry,
        }
    }

    /// Claim and run one task.
    pub async fn execute(&self, task_id: TaskId, now: DateTime<Utc>) -> Result<ExecutionOutcome, WorkerError> {
        let task = match self.tasks.claim(task_id, now).await? {
            ClaimOutcome::Claimed(task) => task,
            ClaimOutcome::Locked => {
                debug!(task_id = %task_id, "task locked by another worker; skipping");
                return Ok(ExecutionOutcome::SkippedLocked);
            }
            ClaimOutcome::NotEligible(eligibility) => {
                debug!(task_id = %task_id, eligibility = ?eligibility, "task no longer eligible; skipping");
                return Ok(ExecutionOutcome::not_eligible(&eligibility));
            }
        };

        self.run_claimed(task, now).await
    }

    /// Pull the task's due time forward and execute it immediately.
    pub async fn trigger_now(&self, task_id: TaskId, now: DateTime<Utc>) -> Result<ExecutionOutcome, WorkerError> {
        self.tasks.make_due(task_id, now).await?;
        self.execute(task_id, now).await
    }

    async fn run_claimed(&self, mut task: FollowUpTask, now: DateTime<Utc>) -> Result<ExecutionOutcome, WorkerError> {
        let contact = match self.contacts.resolve(&task.target).await {
            Ok(Some(contact)) => contact,
            Ok(None) => return self.fail(task, NO_LINKED_TARGET, now).await,
            Err(e) => {
                let error = format!("contact lookup failed: {e}");
                return self.retry_or_fail(task, error, now).await;
            }
        };
        let Some(phone) = contact.phone().map(str::to_string) else {
            return self.fail(task, NO_PHONE_NUMBER, now).await;
        };

        let context = merge_context(&task.context, task.id, task.reason());

        let mut record = CallRecord::initiated(task.id, now);
        if let Err(e) = self.calls.create(&record).await {
            let error = format!("failed to create call record: {e}");
            return self.retry_or_fail(task, error, now).await;
        }

        let request = DialRequest {
            phone,
            contact_name: contact.name.clone(),
            context,
        };

        match self.dialer.place_call(&request).await {
            Ok(receipt) => {
                let dialed_at = Utc::now().max(now);
                record.mark_dialed(receipt.provider_call_id.clone(), receipt.conversation_id.clone(), dialed_at);
                self.calls.update(&record).await?;
                self.calls
                    .append_metadata(
                        record.id,
                        &MetadataSnapshot::new(SnapshotSource::Dialer, receipt.raw, dialed_at),
                    )
                    .await?;

                task.complete(record.id, dialed_at).map_err(TaskStoreError::from)?;
                self.tasks.save(&task).await?;

                info!(
                    task_id = %task.id,
                    call_record_id = %record.id,
                    provider_call_id = %receipt.provider_call_id,
                    attempt = task.attempts,
                    "follow-up call placed"
                );
                Ok(ExecutionOutcome::Completed {
                    call_record_id: record.id,
                })
            }
            Err(err) => {
                record.mark_dial_failed(Utc::now().max(now));
                self.calls.update(&record).await?;
                match err {
                    DialError::Transient(reason) => self.retry_or_fail(task, reason, now).await,
                    DialError::Rejected(reason) => self.fail(task, reason, now).await,
                }
            }
        }
    }

    async fn retry_or_fail(
        &self,
        mut task: FollowUpTask,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome, WorkerError> {
        if !self.retry.should_retry(task.attempts) {
            return self.fail(task, error, now).await;
        }

        let delay = self.retry.delay_for_attempt(task.attempts);
        let retry_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
        let claim = task.claimed_at;
        task.schedule_retry(error.clone(), retry_at, now)
            .map_err(TaskStoreError::from)?;

        let held = match claim {
            Some(claimed_at) => self.tasks.save_if_claimed(&task, claimed_at).await?,
            None => false,
        };
        if !held {
            info!(task_id = %task.id, error = %error, "claim lost while dialing; retry dropped");
            return Ok(ExecutionOutcome::ClaimLost { error });
        }
        self.jobs.enqueue(execute_job(task.id).scheduled_at(retry_at))?;

        warn!(
            task_id = %task.id,
            attempt = task.attempts,
            max_retries = self.retry.max_retries,
            retry_at = %retry_at,
            error = %error,
            "dial failed; retry scheduled"
        );
        Ok(ExecutionOutcome::RetryScheduled {
            attempt: task.attempts,
            retry_at,
            error,
        })
    }

    async fn fail(
        &self,
        mut task: FollowUpTask,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome, WorkerError> {
        let error = error.into();
        task.fail(error.clone(), now).map_err(TaskStoreError::from)?;
        self.tasks.save(&task).await?;
        warn!(task_id = %task.id, attempt = task.attempts, error = %error, "follow-up failed");
        Ok(ExecutionOutcome::Failed { error })
    }
}

#[async_trait]
impl JobHandler for ExecutionWorker {
    async fn handle(&self, job: &Job) -> JobResult {
        let JobKind::ExecuteFollowUp { task_id } = job.kind else {
            return JobResult::Failure(format!("unexpected job kind: {}", job.kind.type_name()));
        };

        match self.execute(task_id, Utc::now()).await {
            Ok(outcome) => {
                debug!(task_id = %task_id, outcome = ?outcome, "execution job finished");
                JobResult::Success
            }
            Err(WorkerError::Tasks(TaskStoreError::NotFound(_))) => {
                warn!(task_id = %task_id, "task vanished before execution");
                JobResult::Success
            }
            Err(e) => JobResult::Failure(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::call_store::InMemoryCallStore;
    use crate::external::{Contact, DialReceipt, InMemoryContactDirectory, ScriptedDialer};
    use crate::jobs::InMemoryJobStore;
    use crate::task_store::InMemoryTaskStore;
    use dialback_calls::CallStatus;
    use dialback_core::LeadId;
    use dialback_followups::{Channel, REASON_KEY, TASK_ID_KEY, TargetRef, TaskStatus};
    use serde_json::json;

    struct Harness {
        tasks: Arc<InMemoryTaskStore>,
        calls: Arc<InMemoryCallStore>,
        contacts: Arc<InMemoryContactDirectory>,
        dialer: Arc<ScriptedDialer>,
        jobs: Arc<InMemoryJobStore>,
        worker: ExecutionWorker,
    }

    fn harness(max_retries: u32) -> Harness {
        let tasks = InMemoryTaskStore::arc();
        let calls = InMemoryCallStore::arc();
        let contacts = Arc::new(InMemoryContactDirectory::new());
        let dialer = Arc::new(ScriptedDialer::new());
        let jobs = InMemoryJobStore::arc();
        let worker = ExecutionWorker::new(
            tasks.clone(),
            calls.clone(),
            contacts.clone(),
            dialer.clone(),
            jobs.clone(),
            RetryPolicy::fixed(max_retries, Duration::ZERO),
        );
        Harness {
            tasks,
            calls,
            contacts,
            dialer,
            jobs,
            worker,
        }
    }

    async fn due_task(h: &Harness, phone: Option<&str>) -> FollowUpTask {
        let now = Utc::now();
        let target = TargetRef::Lead(LeadId::new());
        h.contacts
            .insert(
                target,
                Contact {
                    name: Some("Ana".to_string()),
                    phone: phone.map(str::to_string),
                },
            )
            .unwrap();
        let mut context = serde_json::Map::new();
        context.insert("course".to_string(), json!("nursing"));
        let task = FollowUpTask::new(target, Channel::VoiceCall, now - chrono::Duration::minutes(1), now)
            .with_notes("asked for a callback")
            .with_context(context);
        h.tasks.insert(&task).await.unwrap();
        task
    }

    #[tokio::test]
    async fn successful_dial_completes_task_and_links_call() {
        let h = harness(3);
        let task = due_task(&h, Some("+15550100")).await;

        let outcome = h.worker.execute(task.id, Utc::now()).await.unwrap();
        let ExecutionOutcome::Completed { call_record_id } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };

        let stored = h.tasks.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.completed);
        assert_eq!(stored.call_record_id, Some(call_record_id));
        assert_eq!(stored.attempts, 1);

        let record = h.calls.get(call_record_id).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::InProgress);
        assert_eq!(record.task_id, Some(task.id));
        assert_eq!(record.external_call_id.as_deref(), Some("sim-call-1"));
        assert_eq!(record.metadata.len(), 1);
        assert_eq!(record.metadata[0].source, SnapshotSource::Dialer);

        let calls = h.dialer.calls();
        assert_eq!(calls[0].phone, "+15550100");
        assert_eq!(calls[0].context["course"], json!("nursing"));
        assert_eq!(calls[0].context[TASK_ID_KEY], json!(task.id.to_string()));
        assert_eq!(calls[0].context[REASON_KEY], json!("asked for a callback"));
    }

    #[tokio::test]
    async fn transient_failures_retry_until_budget_is_spent() {
        let h = harness(3);
        let task = due_task(&h, Some("+15550100")).await;
        h.dialer.fail_transiently(10, "503 from dialer");

        let mut outcomes = Vec::new();
        for _ in 0..6 {
            outcomes.push(h.worker.execute(task.id, Utc::now()).await.unwrap());
        }

        let retries = outcomes
            .iter()
            .filter(|o| matches!(o, ExecutionOutcome::RetryScheduled { .. }))
            .count();
        assert_eq!(retries, 3);
        assert!(matches!(outcomes[3], ExecutionOutcome::Failed { .. }));
        assert!(matches!(outcomes[4], ExecutionOutcome::SkippedNotEligible { .. }));
        assert_eq!(h.dialer.call_count(), 4);

        let stored = h.tasks.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(!stored.completed);
        assert_eq!(stored.last_error.as_deref(), Some("503 from dialer"));

        // One delayed execution job per retry.
        assert_eq!(h.jobs.stats().unwrap().pending, 3);
        let failed_calls = h
            .calls
            .records()
            .unwrap()
            .into_iter()
            .filter(|r| r.status == CallStatus::Failed)
            .count();
        assert_eq!(failed_calls, 4);
    }

    #[tokio::test]
    async fn rejected_dial_fails_without_retry() {
        let h = harness(3);
        let task = due_task(&h, Some("+15550100")).await;
        h.dialer.push(Err(DialError::Rejected("invalid number".to_string())));

        let outcome = h.worker.execute(task.id, Utc::now()).await.unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Failed {
                error: "invalid number".to_string()
            }
        );
        assert_eq!(h.jobs.stats().unwrap().pending, 0);
    }

    #[tokio::test]
    async fn missing_target_or_phone_fails_permanently() {
        let h = harness(3);
        let task = due_task(&h, Some("+15550100")).await;
        h.contacts.remove(&task.target).unwrap();

        let outcome = h.worker.execute(task.id, Utc::now()).await.unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Failed {
                error: NO_LINKED_TARGET.to_string()
            }
        );

        let no_phone = due_task(&h, None).await;
        let outcome = h.worker.execute(no_phone.id, Utc::now()).await.unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Failed {
                error: NO_PHONE_NUMBER.to_string()
            }
        );
        assert_eq!(h.dialer.call_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_before_claim_is_never_dialed() {
        let h = harness(3);
        let task = due_task(&h, Some("+15550100")).await;
        h.tasks.cancel(task.id, Utc::now()).await.unwrap();

        let outcome = h.worker.execute(task.id, Utc::now()).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::SkippedNotEligible { .. }));
        assert_eq!(h.dialer.call_count(), 0);
    }

    #[tokio::test]
    async fn in_progress_task_is_skipped_as_locked() {
        let h = harness(3);
        let task = due_task(&h, Some("+15550100")).await;
        assert!(matches!(
            h.tasks.claim(task.id, Utc::now()).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));

        assert_eq!(
            h.worker.execute(task.id, Utc::now()).await.unwrap(),
            ExecutionOutcome::SkippedLocked
        );
    }

    #[tokio::test]
    async fn cancel_during_flight_is_overwritten_by_result() {
        let h = harness(3);
        let task = due_task(&h, Some("+15550100")).await;
        let now = Utc::now();

        let ClaimOutcome::Claimed(claimed) = h.tasks.claim(task.id, now).await.unwrap() else {
            panic!("claim failed");
        };
        // Operator cancels while the dialer call is in flight.
        h.tasks.cancel(task.id, now).await.unwrap();

        let outcome = h.worker.run_claimed(claimed, now).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Completed { .. }));
        let stored = h.tasks.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        stored.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn cancel_during_flight_is_not_revived_by_retry() {
        let h = harness(3);
        let task = due_task(&h, Some("+15550100")).await;
        h.dialer.fail_transiently(1, "503 from dialer");
        let now = Utc::now();

        let ClaimOutcome::Claimed(claimed) = h.tasks.claim(task.id, now).await.unwrap() else {
            panic!("claim failed");
        };
        h.tasks.cancel(task.id, now).await.unwrap();

        let outcome = h.worker.run_claimed(claimed, now).await.unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::ClaimLost {
                error: "503 from dialer".to_string()
            }
        );

        let stored = h.tasks.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert!(stored.completed);
        stored.check_invariants().unwrap();
        assert_eq!(h.jobs.stats().unwrap().pending, 0);
        assert_eq!(h.dialer.call_count(), 1);

        // Nothing left for a later scan to pick up.
        assert!(matches!(
            h.worker.execute(task.id, Utc::now()).await.unwrap(),
            ExecutionOutcome::SkippedNotEligible { .. }
        ));
        assert_eq!(h.dialer.call_count(), 1);
    }

    #[tokio::test]
    async fn reclaimed_task_is_not_rescheduled_by_abandoned_worker() {
        let h = harness(3);
        let task = due_task(&h, Some("+15550100")).await;
        h.dialer.fail_transiently(1, "503 from dialer");
        let claimed_at = Utc::now();

        let ClaimOutcome::Claimed(claimed) = h.tasks.claim(task.id, claimed_at).await.unwrap() else {
            panic!("claim failed");
        };
        let now = claimed_at + chrono::Duration::minutes(15);
        let reaped = h
            .tasks
            .reap_expired_claims(now - chrono::Duration::minutes(10), now)
            .await
            .unwrap();
        assert_eq!(reaped, vec![task.id]);

        let outcome = h.worker.run_claimed(claimed, now).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::ClaimLost { .. }));
        let stored = h.tasks.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.last_error.as_deref(), Some(dialback_followups::CLAIM_EXPIRED));
        assert_eq!(h.jobs.stats().unwrap().pending, 0);
    }

    #[tokio::test]
    async fn trigger_now_runs_future_task() {
        let h = harness(3);
        let target = TargetRef::Lead(LeadId::new());
        h.contacts
            .insert(
                target,
                Contact {
                    name: None,
                    phone: Some("+15550199".to_string()),
                },
            )
            .unwrap();
        let now = Utc::now();
        let task = FollowUpTask::new(target, Channel::Phone, now + chrono::Duration::days(1), now);
        h.tasks.insert(&task).await.unwrap();

        let outcome = h.worker.trigger_now(task.id, Utc::now()).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Completed { .. }));
        assert!(h.worker.trigger_now(task.id, Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_executions_dial_once() {
        let h = Arc::new(harness(3));
        let task = due_task(&h, Some("+15550100")).await;
        h.dialer.push(Ok(DialReceipt {
            provider_call_id: "CA-only".to_string(),
            conversation_id: None,
            raw: json!({}),
        }));

        let mut joins = Vec::new();
        for _ in 0..6 {
            let h = h.clone();
            joins.push(tokio::spawn(async move { h.worker.execute(task.id, Utc::now()).await.unwrap() }));
        }
        let mut completed = 0;
        for join in joins {
            if matches!(join.await.unwrap(), ExecutionOutcome::Completed { .. }) {
                completed += 1;
            }
        }

        assert_eq!(completed, 1);
        assert_eq!(h.dialer.call_count(), 1);
    }

    #[tokio::test]
    async fn job_handler_treats_missing_task_as_done() {
        let h = harness(3);
        let job = execute_job(TaskId::new());
        assert_eq!(h.worker.handle(&job).await, JobResult::Success);
    }
}
