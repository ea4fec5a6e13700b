//! Provider webhook reconciliation.
//!
//! Every body is archived before it is interpreted. Events are correlated to a
//! call record by provider call id, then conversation id, then a bounded scan
//! of archived metadata; an event that matches nothing gets a diagnostic
//! record of its own. Transcript persistence replaces the stored turns, so a
//! replayed payload leaves the same transcript behind.
//!
//! Once an event is correlated the provider always gets a 200: a failed write
//! after that point is logged and reported as a `degraded` ack, because a
//! provider redelivery would not repair it. Only a failure to create the
//! diagnostic record surfaces as an error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use dialback_calls::{CallRecord, MetadataSnapshot, ProviderEvent, SnapshotSource, order_turns};
use dialback_core::CallRecordId;

use crate::call_store::{CallStore, CallStoreError};
use crate::external::{Analysis, ConversationFetcher, ExternalError};
use crate::jobs::{Job, JobHandler, JobKind, JobResult, JobStore, JobStoreError, RetryPolicy};

/// Header carrying the shared webhook secret.
pub const SECRET_HEADER: &str = "x-webhook-secret";

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Calls(#[from] CallStoreError),
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
    #[error("conversation fetch failed: {0}")]
    Fetch(#[from] ExternalError),
    #[error("no conversation client configured")]
    FetchUnavailable,
    #[error("conversation {0} has no transcript yet")]
    TranscriptNotReady(String),
}

/// How an event was matched to its call record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Correlation {
    ExternalCallId,
    ConversationId,
    MetadataScan,
    /// Nothing matched; a diagnostic record was created.
    Diagnostic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Accepted,
    /// Body was not JSON; it is archived and otherwise ignored.
    Malformed,
    /// Correlated, but at least one later write failed; see `failed_steps`.
    Degraded,
}

/// Acknowledgment returned to the provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookAck {
    pub status: AckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_record_id: Option<CallRecordId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation: Option<Correlation>,
    pub turns_persisted: u64,
    pub fetch_pending: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_steps: Vec<&'static str>,
}

impl WebhookAck {
    fn malformed() -> Self {
        Self {
            status: AckStatus::Malformed,
            call_record_id: None,
            correlation: None,
            turns_persisted: 0,
            fetch_pending: false,
            failed_steps: Vec::new(),
        }
    }
}

/// Steps of one ingestion that failed after correlation.
#[derive(Debug, Default)]
struct Degradation {
    failed: Vec<&'static str>,
}

impl Degradation {
    fn note<T, E: std::fmt::Display>(&mut self, step: &'static str, result: Result<T, E>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                error!(step, error = %e, "webhook step failed; continuing");
                self.failed.push(step);
                None
            }
        }
    }
}

pub struct WebhookReconciler {
    calls: Arc<dyn CallStore>,
    jobs: Arc<dyn JobStore>,
    fetcher: Option<Arc<dyn ConversationFetcher>>,
    secret: Option<String>,
    scan_window: chrono::Duration,
    fetch_retry: RetryPolicy,
}

impl WebhookReconciler {
    pub fn new(
        calls: Arc<dyn CallStore>,
        jobs: Arc<dyn JobStore>,
        secret: Option<String>,
        scan_window: chrono::Duration,
    ) -> Self {
        Self {
            calls,
            jobs,
            fetcher: None,
            secret: secret.filter(|s| !s.is_empty()),
            scan_window,
            fetch_retry: RetryPolicy::exponential(5, Duration::from_secs(10), Duration::from_secs(600)),
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ConversationFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_fetch_retry(mut self, policy: RetryPolicy) -> Self {
        self.fetch_retry = policy;
        self
    }

    /// Constant-time check of the shared secret. Fails closed when no secret
    /// is configured.
    pub fn authenticate(&self, provided: Option<&str>) -> bool {
        match (self.secret.as_deref(), provided) {
            (Some(expected), Some(provided)) => secrets_match(expected, provided),
            _ => false,
        }
    }

    /// Archive, normalize, correlate and persist one webhook body.
    pub async fn ingest(&self, body: &str, now: DateTime<Utc>) -> Result<WebhookAck, ReconcileError> {
        if let Err(e) = self.calls.archive_payload(body, now).await {
            error!(error = %e, "failed to archive webhook body");
        }

        let payload: Value = match serde_json::from_str(body) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, bytes = body.len(), "webhook body is not JSON; archived only");
                return Ok(WebhookAck::malformed());
            }
        };

        let event = ProviderEvent::from_json(&payload);
        let mut degraded = Degradation::default();
        let (mut record, correlation) = self.correlate(&event, now, &mut degraded).await?;
        debug!(
            call_record_id = %record.id,
            correlation = ?correlation,
            event_type = event.event_type.as_deref().unwrap_or("-"),
            "webhook correlated"
        );

        degraded.note(
            "append_metadata",
            self.calls
                .append_metadata(record.id, &MetadataSnapshot::new(SnapshotSource::Webhook, payload, now))
                .await,
        );
        record.apply_event(&event, now);

        let mut turns_persisted = 0;
        if event.has_transcript() {
            let turns = order_turns(event.turns.clone());
            match degraded.note("replace_transcript", self.calls.replace_transcript(record.id, &turns).await) {
                Some(stored) => {
                    turns_persisted = stored;
                    record.fetch_pending = false;
                }
                // Recover the transcript from the provider instead of waiting for a redelivery.
                None => self.schedule_fetch(&mut record, &event, &mut degraded),
            }
        } else if event.needs_fetch() {
            self.schedule_fetch(&mut record, &event, &mut degraded);
        }

        degraded.note("update_record", self.calls.update(&record).await);

        if turns_persisted > 0 {
            degraded.note("enqueue_analysis", self.enqueue_analysis(record.id));
        }

        let status = if degraded.failed.is_empty() {
            AckStatus::Accepted
        } else {
            AckStatus::Degraded
        };
        info!(
            call_record_id = %record.id,
            correlation = ?correlation,
            status = %record.status,
            turns = turns_persisted,
            fetch_pending = record.fetch_pending,
            degraded = !degraded.failed.is_empty(),
            "webhook reconciled"
        );

        Ok(WebhookAck {
            status,
            call_record_id: Some(record.id),
            correlation: Some(correlation),
            turns_persisted,
            fetch_pending: record.fetch_pending,
            failed_steps: degraded.failed,
        })
    }

    /// Mark the transcript as pending and queue a fetch when a client exists.
    fn schedule_fetch(&self, record: &mut CallRecord, event: &ProviderEvent, degraded: &mut Degradation) {
        record.fetch_pending = true;
        let (Some(_), Some(conversation_id)) = (&self.fetcher, &event.conversation_id) else {
            warn!(call_record_id = %record.id, "conversation fetch needed but no client configured");
            return;
        };
        let job = Job::new(JobKind::FetchConversation {
            call_id: record.id,
            conversation_id: conversation_id.clone(),
        })
        .with_retry_policy(self.fetch_retry.clone());
        degraded.note("enqueue_fetch", self.jobs.enqueue(job));
    }

    /// A failed lookup counts as no match; the next strategy is tried.
    async fn correlate(
        &self,
        event: &ProviderEvent,
        now: DateTime<Utc>,
        degraded: &mut Degradation,
    ) -> Result<(CallRecord, Correlation), ReconcileError> {
        if let Some(call_id) = event.call_id.as_deref() {
            let found = self.calls.find_by_external_call_id(call_id).await;
            if let Some(record) = degraded.note("lookup_call_id", found).flatten() {
                return Ok((record, Correlation::ExternalCallId));
            }
        }
        if let Some(conversation_id) = event.conversation_id.as_deref() {
            let found = self.calls.find_by_conversation_id(conversation_id).await;
            if let Some(record) = degraded.note("lookup_conversation_id", found).flatten() {
                return Ok((record, Correlation::ConversationId));
            }
        }

        let since = now.checked_sub_signed(self.scan_window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        for needle in event.correlation_needles() {
            let found = self.calls.find_by_metadata_mention(needle, since).await;
            if let Some(record) = degraded.note("metadata_scan", found).flatten() {
                return Ok((record, Correlation::MetadataScan));
            }
        }

        let record = CallRecord::diagnostic(event, now);
        self.calls.create(&record).await?;
        warn!(
            call_record_id = %record.id,
            call_id = event.call_id.as_deref().unwrap_or("-"),
            conversation_id = event.conversation_id.as_deref().unwrap_or("-"),
            "webhook matched no call; diagnostic record created"
        );
        Ok((record, Correlation::Diagnostic))
    }

    /// Retrieve a conversation announced by a preview and persist its
    /// transcript. Returns the number of turns stored.
    pub async fn fetch_conversation(
        &self,
        call_id: CallRecordId,
        conversation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, ReconcileError> {
        let fetcher = self.fetcher.as_ref().ok_or(ReconcileError::FetchUnavailable)?;
        let mut record = self
            .calls
            .get(call_id)
            .await?
            .ok_or(CallStoreError::NotFound(call_id))?;

        let payload = fetcher.fetch(conversation_id).await?;
        let event = ProviderEvent::from_json(&payload);

        self.calls
            .append_metadata(record.id, &MetadataSnapshot::new(SnapshotSource::Fetch, payload, now))
            .await?;
        record.apply_event(&event, now);

        if !event.has_transcript() && !record.status.is_terminal() {
            self.calls.update(&record).await?;
            return Err(ReconcileError::TranscriptNotReady(conversation_id.to_string()));
        }

        let turns = order_turns(event.turns);
        let stored = self.calls.replace_transcript(record.id, &turns).await?;
        record.fetch_pending = false;
        self.calls.update(&record).await?;

        if stored > 0 {
            self.enqueue_analysis(record.id)?;
        }
        info!(call_record_id = %record.id, conversation_id, turns = stored, "conversation fetched");
        Ok(stored)
    }

    fn enqueue_analysis(&self, call_id: CallRecordId) -> Result<(), JobStoreError> {
        self.jobs.enqueue(
            Job::new(JobKind::AnalyzeCall { call_id }).with_retry_policy(RetryPolicy::exponential(
                3,
                Duration::from_secs(5),
                Duration::from_secs(120),
            )),
        )?;
        Ok(())
    }
}

/// Compare through fixed-size digests so timing does not depend on where the
/// inputs first differ.
fn secrets_match(expected: &str, provided: &str) -> bool {
    let expected = Sha256::digest(expected.as_bytes());
    let provided = Sha256::digest(provided.as_bytes());
    expected
        .iter()
        .zip(provided.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[async_trait]
impl JobHandler for WebhookReconciler {
    async fn handle(&self, job: &Job) -> JobResult {
        let JobKind::FetchConversation {
            call_id,
            conversation_id,
        } = &job.kind
        else {
            return JobResult::Failure(format!("unexpected job kind: {}", job.kind.type_name()));
        };

        match self.fetch_conversation(*call_id, conversation_id, Utc::now()).await {
            Ok(_) => JobResult::Success,
            Err(ReconcileError::Calls(CallStoreError::NotFound(_))) => {
                warn!(call_record_id = %call_id, "call record purged before fetch");
                JobResult::Success
            }
            Err(e) => JobResult::Failure(e.to_string()),
        }
    }
}

/// Runs `AnalyzeCall` jobs against the analysis collaborator.
pub struct AnalyzeCallHandler {
    analysis: Arc<dyn Analysis>,
}

impl AnalyzeCallHandler {
    pub fn new(analysis: Arc<dyn Analysis>) -> Self {
        Self { analysis }
    }
}

#[async_trait]
impl JobHandler for AnalyzeCallHandler {
    async fn handle(&self, job: &Job) -> JobResult {
        let JobKind::AnalyzeCall { call_id } = job.kind else {
            return JobResult::Failure(format!("unexpected job kind: {}", job.kind.type_name()));
        };
        match self.analysis.analyze(call_id).await {
            Ok(()) => JobResult::Success,
            Err(e) => JobResult::Failure(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_store::InMemoryCallStore;
    use crate::external::{LoggingAnalysis, StaticConversationFetcher};
    use crate::jobs::InMemoryJobStore;
    use std::collections::HashSet;
    use std::sync::Mutex;

    use dialback_calls::{CallStatus, TranscriptTurn};
    use dialback_core::TaskId;
    use serde_json::json;
    use uuid::Uuid;

    /// Wraps the in-memory store and fails the named operations.
    struct FailingCallStore {
        inner: Arc<InMemoryCallStore>,
        failing: Mutex<HashSet<&'static str>>,
    }

    impl FailingCallStore {
        fn new(inner: Arc<InMemoryCallStore>, failing: &[&'static str]) -> Self {
            Self {
                inner,
                failing: Mutex::new(failing.iter().copied().collect()),
            }
        }

        fn check(&self, operation: &'static str) -> Result<(), CallStoreError> {
            if self.failing.lock().unwrap().contains(operation) {
                return Err(CallStoreError::Storage(format!("{operation}: connection reset")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CallStore for FailingCallStore {
        async fn create(&self, record: &CallRecord) -> Result<(), CallStoreError> {
            self.check("create")?;
            self.inner.create(record).await
        }

        async fn get(&self, id: CallRecordId) -> Result<Option<CallRecord>, CallStoreError> {
            self.check("get")?;
            self.inner.get(id).await
        }

        async fn find_by_external_call_id(&self, call_id: &str) -> Result<Option<CallRecord>, CallStoreError> {
            self.check("find_by_external_call_id")?;
            self.inner.find_by_external_call_id(call_id).await
        }

        async fn find_by_conversation_id(&self, conversation_id: &str) -> Result<Option<CallRecord>, CallStoreError> {
            self.check("find_by_conversation_id")?;
            self.inner.find_by_conversation_id(conversation_id).await
        }

        async fn find_by_metadata_mention(
            &self,
            needle: &str,
            since: DateTime<Utc>,
        ) -> Result<Option<CallRecord>, CallStoreError> {
            self.check("find_by_metadata_mention")?;
            self.inner.find_by_metadata_mention(needle, since).await
        }

        async fn append_metadata(&self, id: CallRecordId, snapshot: &MetadataSnapshot) -> Result<(), CallStoreError> {
            self.check("append_metadata")?;
            self.inner.append_metadata(id, snapshot).await
        }

        async fn update(&self, record: &CallRecord) -> Result<(), CallStoreError> {
            self.check("update")?;
            self.inner.update(record).await
        }

        async fn replace_transcript(&self, id: CallRecordId, turns: &[TranscriptTurn]) -> Result<u64, CallStoreError> {
            self.check("replace_transcript")?;
            self.inner.replace_transcript(id, turns).await
        }

        async fn transcript(&self, id: CallRecordId) -> Result<Vec<TranscriptTurn>, CallStoreError> {
            self.check("transcript")?;
            self.inner.transcript(id).await
        }

        async fn archive_payload(&self, body: &str, received_at: DateTime<Utc>) -> Result<Uuid, CallStoreError> {
            self.check("archive_payload")?;
            self.inner.archive_payload(body, received_at).await
        }

        async fn purge_before(&self, before: DateTime<Utc>) -> Result<u64, CallStoreError> {
            self.check("purge_before")?;
            self.inner.purge_before(before).await
        }
    }

    fn failing_reconciler(
        inner: Arc<InMemoryCallStore>,
        jobs: Arc<InMemoryJobStore>,
        failing: &[&'static str],
    ) -> WebhookReconciler {
        WebhookReconciler::new(
            Arc::new(FailingCallStore::new(inner, failing)),
            jobs,
            Some("s3cret".to_string()),
            chrono::Duration::hours(48),
        )
    }

    struct Harness {
        calls: Arc<InMemoryCallStore>,
        jobs: Arc<InMemoryJobStore>,
        fetcher: Arc<StaticConversationFetcher>,
        reconciler: WebhookReconciler,
    }

    fn harness(with_fetcher: bool) -> Harness {
        let calls = InMemoryCallStore::arc();
        let jobs = InMemoryJobStore::arc();
        let fetcher = Arc::new(StaticConversationFetcher::new());
        let mut reconciler = WebhookReconciler::new(
            calls.clone(),
            jobs.clone(),
            Some("s3cret".to_string()),
            chrono::Duration::hours(48),
        );
        if with_fetcher {
            reconciler = reconciler.with_fetcher(fetcher.clone());
        }
        Harness {
            calls,
            jobs,
            fetcher,
            reconciler,
        }
    }

    async fn dialed_record(h: &Harness, call_id: &str, conversation_id: Option<&str>) -> CallRecord {
        let now = Utc::now();
        let mut record = CallRecord::initiated(TaskId::new(), now);
        record.mark_dialed(call_id, conversation_id.map(str::to_string), now);
        h.calls.create(&record).await.unwrap();
        record
    }

    fn queued_kinds(h: &Harness) -> Vec<JobKind> {
        h.jobs
            .list_by_status(None, 100)
            .unwrap()
            .into_iter()
            .map(|j| j.kind)
            .collect()
    }

    fn completed_payload(conversation_id: &str) -> String {
        json!({
            "type": "post_call_transcription",
            "data": {
                "conversation_id": conversation_id,
                "status": "done",
                "transcript": [
                    { "role": "user", "message": "Twelve", "time_in_call_secs": 12.0 },
                    { "role": "agent", "message": "One", "time_in_call_secs": 1.0 },
                    { "role": "user", "message": "Five", "time_in_call_secs": 5.0 }
                ]
            }
        })
        .to_string()
    }

    #[test]
    fn authentication_fails_closed() {
        let h = harness(false);
        assert!(h.reconciler.authenticate(Some("s3cret")));
        assert!(!h.reconciler.authenticate(Some("s3cret ")));
        assert!(!h.reconciler.authenticate(Some("")));
        assert!(!h.reconciler.authenticate(None));

        let unset = WebhookReconciler::new(
            InMemoryCallStore::arc(),
            InMemoryJobStore::arc(),
            None,
            chrono::Duration::hours(1),
        );
        assert!(!unset.authenticate(Some("")));
        assert!(!unset.authenticate(Some("anything")));
    }

    #[tokio::test]
    async fn transcript_is_ordered_and_replay_is_idempotent() {
        let h = harness(false);
        let record = dialed_record(&h, "CA1", Some("conv_1")).await;
        let body = completed_payload("conv_1");

        let first = h.reconciler.ingest(&body, Utc::now()).await.unwrap();
        let second = h.reconciler.ingest(&body, Utc::now()).await.unwrap();

        assert_eq!(first.call_record_id, Some(record.id));
        assert_eq!(first.correlation, Some(Correlation::ConversationId));
        assert_eq!(first.turns_persisted, 3);
        assert_eq!(second.turns_persisted, 3);

        let transcript = h.calls.transcript(record.id).await.unwrap();
        let offsets: Vec<_> = transcript.iter().map(|t| t.time_offset_seconds).collect();
        assert_eq!(offsets, vec![Some(1.0), Some(5.0), Some(12.0)]);
        let texts: Vec<_> = transcript.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["One", "Five", "Twelve"]);

        let stored = h.calls.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Completed);
        assert_eq!(stored.metadata.len(), 2);
        assert_eq!(h.calls.archived().unwrap().len(), 2);

        let analyses = queued_kinds(&h)
            .into_iter()
            .filter(|k| matches!(k, JobKind::AnalyzeCall { .. }))
            .count();
        assert_eq!(analyses, 2);
    }

    #[tokio::test]
    async fn call_id_wins_over_conversation_id() {
        let h = harness(false);
        let by_call = dialed_record(&h, "CA9", None).await;
        let _by_conversation = dialed_record(&h, "CA10", Some("conv_9")).await;

        let body = json!({ "call_sid": "CA9", "conversation_id": "conv_9", "status": "in-progress" }).to_string();
        let ack = h.reconciler.ingest(&body, Utc::now()).await.unwrap();

        assert_eq!(ack.call_record_id, Some(by_call.id));
        assert_eq!(ack.correlation, Some(Correlation::ExternalCallId));
        // Correlation ids are only filled in.
        let stored = h.calls.get(by_call.id).await.unwrap().unwrap();
        assert_eq!(stored.conversation_id.as_deref(), Some("conv_9"));
    }

    #[tokio::test]
    async fn unmatched_event_creates_one_diagnostic_record() {
        let h = harness(false);
        let body = completed_payload("conv_unknown");

        let first = h.reconciler.ingest(&body, Utc::now()).await.unwrap();
        assert_eq!(first.correlation, Some(Correlation::Diagnostic));
        let second = h.reconciler.ingest(&body, Utc::now()).await.unwrap();
        assert_eq!(second.correlation, Some(Correlation::ConversationId));
        assert_eq!(second.call_record_id, first.call_record_id);

        let records = h.calls.records().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].diagnostic);
        assert_eq!(records[0].conversation_id.as_deref(), Some("conv_unknown"));
    }

    #[tokio::test]
    async fn metadata_scan_finds_record_without_ids() {
        let h = harness(false);
        let now = Utc::now();
        let record = CallRecord::initiated(TaskId::new(), now);
        h.calls.create(&record).await.unwrap();
        h.calls
            .append_metadata(
                record.id,
                &MetadataSnapshot::new(
                    SnapshotSource::Dialer,
                    json!({ "provider": { "session": "conv_hidden" } }),
                    now,
                ),
            )
            .await
            .unwrap();

        let body = json!({ "conversationId": "conv_hidden", "status": "ringing" }).to_string();
        let ack = h.reconciler.ingest(&body, now).await.unwrap();

        assert_eq!(ack.call_record_id, Some(record.id));
        assert_eq!(ack.correlation, Some(Correlation::MetadataScan));
        let stored = h.calls.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.conversation_id.as_deref(), Some("conv_hidden"));
        assert_eq!(stored.status, CallStatus::InProgress);
    }

    #[tokio::test]
    async fn malformed_body_is_archived_and_acknowledged() {
        let h = harness(false);
        let ack = h.reconciler.ingest("{\"truncated\": ", Utc::now()).await.unwrap();

        assert_eq!(ack.status, AckStatus::Malformed);
        assert_eq!(h.calls.archived().unwrap()[0].body, "{\"truncated\": ");
        assert!(h.calls.records().unwrap().is_empty());
    }

    #[tokio::test]
    async fn preview_schedules_fetch_and_fetch_persists_transcript() {
        let h = harness(true);
        let record = dialed_record(&h, "CA3", Some("conv_3")).await;
        h.fetcher.insert("conv_3", serde_json::from_str(&completed_payload("conv_3")).unwrap());

        let preview = json!({
            "type": "conversation.preview",
            "conversation_id": "conv_3",
            "transcript": "Twelve... One..."
        })
        .to_string();
        let ack = h.reconciler.ingest(&preview, Utc::now()).await.unwrap();
        assert!(ack.fetch_pending);
        assert_eq!(ack.turns_persisted, 0);
        assert_eq!(
            queued_kinds(&h),
            vec![JobKind::FetchConversation {
                call_id: record.id,
                conversation_id: "conv_3".to_string()
            }]
        );

        let stored = h.reconciler.fetch_conversation(record.id, "conv_3", Utc::now()).await.unwrap();
        assert_eq!(stored, 3);
        let record = h.calls.get(record.id).await.unwrap().unwrap();
        assert!(!record.fetch_pending);
        assert_eq!(record.metadata.last().unwrap().source, SnapshotSource::Fetch);
        assert!(queued_kinds(&h).iter().any(|k| matches!(k, JobKind::AnalyzeCall { .. })));
    }

    #[tokio::test]
    async fn preview_without_fetcher_only_marks_pending() {
        let h = harness(false);
        let record = dialed_record(&h, "CA4", Some("conv_4")).await;
        let body = json!({ "conversation_id": "conv_4", "status": "completed" }).to_string();

        let ack = h.reconciler.ingest(&body, Utc::now()).await.unwrap();

        assert!(ack.fetch_pending);
        assert!(queued_kinds(&h).is_empty());
        assert!(h.calls.get(record.id).await.unwrap().unwrap().fetch_pending);
        assert!(matches!(
            h.reconciler.fetch_conversation(record.id, "conv_4", Utc::now()).await,
            Err(ReconcileError::FetchUnavailable)
        ));
    }

    #[tokio::test]
    async fn fetch_of_unfinished_conversation_asks_for_retry() {
        let h = harness(true);
        let record = dialed_record(&h, "CA5", Some("conv_5")).await;
        h.fetcher.insert("conv_5", json!({ "conversation_id": "conv_5", "status": "processing" }));

        let job = Job::new(JobKind::FetchConversation {
            call_id: record.id,
            conversation_id: "conv_5".to_string(),
        });
        assert!(matches!(h.reconciler.handle(&job).await, JobResult::Failure(_)));
    }

    #[tokio::test]
    async fn analysis_handler_forwards_call_id() {
        let analysis = Arc::new(LoggingAnalysis::new());
        let handler = AnalyzeCallHandler::new(analysis.clone());
        let call_id = CallRecordId::new();

        let job = Job::new(JobKind::AnalyzeCall { call_id });
        assert_eq!(handler.handle(&job).await, JobResult::Success);
        assert_eq!(analysis.analyzed(), vec![call_id]);
    }

    #[tokio::test]
    async fn transcript_write_failure_after_correlation_is_acknowledged_degraded() {
        let h = harness(false);
        let record = dialed_record(&h, "CA6", Some("conv_6")).await;
        let fetcher = Arc::new(StaticConversationFetcher::new());
        let reconciler = failing_reconciler(h.calls.clone(), h.jobs.clone(), &["replace_transcript"])
            .with_fetcher(fetcher);

        let ack = reconciler.ingest(&completed_payload("conv_6"), Utc::now()).await.unwrap();

        assert_eq!(ack.status, AckStatus::Degraded);
        assert_eq!(ack.call_record_id, Some(record.id));
        assert_eq!(ack.correlation, Some(Correlation::ConversationId));
        assert_eq!(ack.failed_steps, vec!["replace_transcript"]);
        assert_eq!(ack.turns_persisted, 0);
        assert!(ack.fetch_pending);

        // Everything that could be written was written.
        let stored = h.calls.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Completed);
        assert!(stored.fetch_pending);
        assert_eq!(stored.metadata.len(), 1);
        assert_eq!(
            queued_kinds(&h),
            vec![JobKind::FetchConversation {
                call_id: record.id,
                conversation_id: "conv_6".to_string()
            }]
        );
        assert_eq!(
            serde_json::to_value(&ack).unwrap()["status"],
            json!("degraded")
        );
    }

    #[tokio::test]
    async fn every_write_failing_after_correlation_still_acknowledges() {
        let h = harness(false);
        let record = dialed_record(&h, "CA7", Some("conv_7")).await;
        let reconciler = failing_reconciler(
            h.calls.clone(),
            h.jobs.clone(),
            &["archive_payload", "append_metadata", "replace_transcript", "update"],
        );

        let ack = reconciler.ingest(&completed_payload("conv_7"), Utc::now()).await.unwrap();

        assert_eq!(ack.status, AckStatus::Degraded);
        assert_eq!(ack.call_record_id, Some(record.id));
        assert_eq!(ack.failed_steps, vec!["append_metadata", "replace_transcript", "update_record"]);
    }

    #[tokio::test]
    async fn failed_lookup_falls_through_to_the_next_strategy() {
        let h = harness(false);
        let record = dialed_record(&h, "CA8", Some("conv_8")).await;
        let reconciler = failing_reconciler(h.calls.clone(), h.jobs.clone(), &["find_by_external_call_id"]);

        let body = json!({ "call_sid": "CA8", "conversation_id": "conv_8", "status": "in-progress" }).to_string();
        let ack = reconciler.ingest(&body, Utc::now()).await.unwrap();

        assert_eq!(ack.status, AckStatus::Degraded);
        assert_eq!(ack.call_record_id, Some(record.id));
        assert_eq!(ack.correlation, Some(Correlation::ConversationId));
        assert_eq!(ack.failed_steps, vec!["lookup_call_id"]);
    }

    #[tokio::test]
    async fn diagnostic_create_failure_is_an_error() {
        let h = harness(false);
        let reconciler = failing_reconciler(h.calls.clone(), h.jobs.clone(), &["create"]);

        let result = reconciler.ingest(&completed_payload("conv_nowhere"), Utc::now()).await;

        assert!(matches!(result, Err(ReconcileError::Calls(CallStoreError::Storage(_)))));
        assert!(h.calls.records().unwrap().is_empty());
        assert_eq!(h.calls.archived().unwrap().len(), 1);
    }
}
