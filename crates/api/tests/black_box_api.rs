use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dialback_api::app::services::{self, AppServices, BackgroundHandles, InMemoryHandles};
use dialback_calls::{CallRecord, MetadataSnapshot, TranscriptTurn};
use dialback_core::{CallRecordId, TaskId};
use dialback_followups::TargetRef;
use dialback_infra::Settings;
use dialback_infra::WebhookReconciler;
use dialback_infra::call_store::{CallStore, CallStoreError, InMemoryCallStore};
use dialback_infra::external::Contact;
use reqwest::StatusCode;
use serde_json::json;
use uuid::Uuid;

const SECRET: &str = "test-secret";

struct TestServer {
    base_url: String,
    handles: InMemoryHandles,
    _background: BackgroundHandles,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(|_, _| {}).await
    }

    /// Spawn with a hook that may swap services before the router is built.
    async fn spawn_with(customize: impl FnOnce(&mut AppServices, &InMemoryHandles)) -> Self {
        let settings = Settings {
            webhook_secret: Some(SECRET.to_string()),
            job_poll_interval_ms: 10,
            dispatch_interval_secs: 3600,
            ..Settings::default()
        };
        let (mut services, handles) = services::in_memory(settings);
        customize(&mut services, &handles);
        let services = Arc::new(services);
        let background = services.spawn_background();

        // Same router as prod, bound to an ephemeral port.
        let app = dialback_api::app::build_app(services);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            handles,
            _background: background,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Register a lead with a phone number and return its id.
    fn seed_lead(&self) -> Uuid {
        let id = Uuid::now_v7();
        self.handles
            .contacts
            .insert(
                TargetRef::Lead(dialback_core::LeadId::from_uuid(id)),
                Contact {
                    name: Some("Grace".to_string()),
                    phone: Some("+15550123".to_string()),
                },
            )
            .unwrap();
        id
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn create_task(client: &reqwest::Client, srv: &TestServer, body: serde_json::Value) -> serde_json::Value {
    let res = client.post(srv.url("/tasks")).json(&body).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    res.json().await.unwrap()
}

async fn task_eventually(client: &reqwest::Client, srv: &TestServer, id: &str, status: &str) -> serde_json::Value {
    // Execution happens on the background job workers; poll until it lands.
    for _ in 0..200 {
        let task: serde_json::Value = client
            .get(srv.url(&format!("/tasks/{id}")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if task["status"] == status {
            return task;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    panic!("task {id} did not reach {status} within timeout");
}

/// In-memory call store whose transcript and record writes always fail.
struct BrokenWrites(Arc<InMemoryCallStore>);

fn broken(operation: &str) -> CallStoreError {
    CallStoreError::Storage(format!("{operation}: connection reset"))
}

#[async_trait]
impl CallStore for BrokenWrites {
    async fn create(&self, record: &CallRecord) -> Result<(), CallStoreError> {
        self.0.create(record).await
    }

    async fn get(&self, id: CallRecordId) -> Result<Option<CallRecord>, CallStoreError> {
        self.0.get(id).await
    }

    async fn find_by_external_call_id(&self, call_id: &str) -> Result<Option<CallRecord>, CallStoreError> {
        self.0.find_by_external_call_id(call_id).await
    }

    async fn find_by_conversation_id(&self, conversation_id: &str) -> Result<Option<CallRecord>, CallStoreError> {
        self.0.find_by_conversation_id(conversation_id).await
    }

    async fn find_by_metadata_mention(
        &self,
        needle: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<CallRecord>, CallStoreError> {
        self.0.find_by_metadata_mention(needle, since).await
    }

    async fn append_metadata(&self, id: CallRecordId, snapshot: &MetadataSnapshot) -> Result<(), CallStoreError> {
        self.0.append_metadata(id, snapshot).await
    }

    async fn update(&self, _record: &CallRecord) -> Result<(), CallStoreError> {
        Err(broken("update"))
    }

    async fn replace_transcript(&self, _id: CallRecordId, _turns: &[TranscriptTurn]) -> Result<u64, CallStoreError> {
        Err(broken("replace_transcript"))
    }

    async fn transcript(&self, id: CallRecordId) -> Result<Vec<TranscriptTurn>, CallStoreError> {
        self.0.transcript(id).await
    }

    async fn archive_payload(&self, body: &str, received_at: DateTime<Utc>) -> Result<Uuid, CallStoreError> {
        self.0.archive_payload(body, received_at).await
    }

    async fn purge_before(&self, before: DateTime<Utc>) -> Result<u64, CallStoreError> {
        self.0.purge_before(before).await
    }
}

#[tokio::test]
async fn health_is_public() {
    let srv = TestServer::spawn().await;
    let res = reqwest::get(srv.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn due_task_is_dialed_and_webhook_transcript_is_ordered() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let lead_id = srv.seed_lead();

    let created = create_task(
        &client,
        &srv,
        json!({
            "target_kind": "lead",
            "target_id": lead_id.to_string(),
            "due_at": "2020-01-01T00:00:00Z",
            "notes": "asked for a callback",
            "context": { "campaign": "spring" },
        }),
    )
    .await;
    assert_eq!(created["status"], "pending");
    let task_id = created["id"].as_str().unwrap().to_string();

    let res = client.post(srv.url("/admin/process-due")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let task = task_eventually(&client, &srv, &task_id, "completed").await;
    assert_eq!(task["completed"], true);
    let call_id = task["call_record_id"].as_str().unwrap().to_string();

    let dialed = srv.handles.dialer.calls();
    assert_eq!(dialed.len(), 1);
    assert_eq!(dialed[0].context["campaign"], "spring");
    assert_eq!(dialed[0].context["task_id"], task_id.as_str());

    let call: serde_json::Value = client
        .get(srv.url(&format!("/calls/{call_id}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(call["status"], "in_progress");
    let conversation_id = call["conversation_id"].as_str().unwrap().to_string();

    let payload = json!({
        "type": "post_call_transcription",
        "conversation_id": conversation_id,
        "transcript": [
            { "speaker": "agent", "text": "third", "time_offset_seconds": 12.0 },
            { "speaker": "agent", "text": "first", "time_offset_seconds": 1.0 },
            { "speaker": "user", "text": "second", "time_offset_seconds": 5.0 }
        ]
    });
    for _ in 0..2 {
        let res = client
            .post(srv.url("/webhooks/voice"))
            .header("x-webhook-secret", SECRET)
            .body(payload.to_string())
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let ack: serde_json::Value = res.json().await.unwrap();
        assert_eq!(ack["status"], "accepted");
        assert_eq!(ack["correlation"], "conversation_id");
        assert_eq!(ack["call_record_id"], call_id.as_str());
    }

    let call: serde_json::Value = client
        .get(srv.url(&format!("/calls/{call_id}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let texts: Vec<&str> = call["transcript"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["text"].as_str().unwrap())
        .collect();
    assert_eq!(texts, ["first", "second", "third"]);
}

#[tokio::test]
async fn webhook_without_valid_secret_is_rejected() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let missing = client
        .post(srv.url("/webhooks/voice"))
        .body(r#"{"conversation_id":"c1"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong = client
        .post(srv.url("/webhooks/voice"))
        .header("x-webhook-secret", "nope")
        .body(r#"{"conversation_id":"c1"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    assert!(srv.handles.calls.archived().unwrap().is_empty());
}

#[tokio::test]
async fn uncorrelated_webhook_creates_one_diagnostic_record() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(srv.url("/webhooks/voice"))
        .header("x-webhook-secret", SECRET)
        .body(r#"{"conversation_id":"conv-unknown","status":"in-progress"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let ack: serde_json::Value = res.json().await.unwrap();
    assert_eq!(ack["correlation"], "diagnostic");

    let records = srv.handles.calls.records().unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].diagnostic);
}

#[tokio::test]
async fn malformed_webhook_is_archived_and_acknowledged() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(srv.url("/webhooks/voice"))
        .header("x-webhook-secret", SECRET)
        .body("not json at all")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let ack: serde_json::Value = res.json().await.unwrap();
    assert_eq!(ack["status"], "malformed");

    let archived = srv.handles.calls.archived().unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].body, "not json at all");
}

#[tokio::test]
async fn trigger_runs_a_future_task_now() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let lead_id = srv.seed_lead();

    let created = create_task(
        &client,
        &srv,
        json!({ "target_kind": "lead", "target_id": lead_id.to_string(), "timing": "tomorrow" }),
    )
    .await;
    let task_id = created["id"].as_str().unwrap();

    let res = client
        .post(srv.url(&format!("/tasks/{task_id}/trigger")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let outcome: serde_json::Value = res.json().await.unwrap();
    assert_eq!(outcome["outcome"], "completed");
}

#[tokio::test]
async fn cancel_conflicts_once_terminal() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let created = create_task(
        &client,
        &srv,
        json!({ "target_kind": "applicant", "target_id": Uuid::now_v7().to_string(), "timing": "in 3 days" }),
    )
    .await;
    let task_id = created["id"].as_str().unwrap();

    let first = client
        .post(srv.url(&format!("/tasks/{task_id}/cancel")))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let task: serde_json::Value = first.json().await.unwrap();
    assert_eq!(task["status"], "cancelled");

    let second = client
        .post(srv.url(&format!("/tasks/{task_id}/cancel")))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn context_enrichment_merges_keys() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let created = create_task(
        &client,
        &srv,
        json!({
            "target_kind": "lead",
            "target_id": Uuid::now_v7().to_string(),
            "timing": "2 hours",
            "context": { "source": "form" },
        }),
    )
    .await;
    let task_id = created["id"].as_str().unwrap();

    let res = client
        .patch(srv.url(&format!("/tasks/{task_id}/context")))
        .json(&json!({ "context": { "score": 7 } }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let task: serde_json::Value = res.json().await.unwrap();
    assert_eq!(task["context"]["source"], "form");
    assert_eq!(task["context"]["score"], 7);
}

#[tokio::test]
async fn unknown_ids_and_bad_input_map_to_client_errors() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let missing = client
        .get(srv.url(&format!("/tasks/{}", Uuid::now_v7())))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let malformed = client.get(srv.url("/tasks/not-a-uuid")).send().await.unwrap();
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

    let bad_status = client.get(srv.url("/tasks?status=sleeping")).send().await.unwrap();
    assert_eq!(bad_status.status(), StatusCode::BAD_REQUEST);

    let stats = client.get(srv.url("/admin/jobs/stats")).send().await.unwrap();
    assert_eq!(stats.status(), StatusCode::OK);
}

#[tokio::test]
async fn webhook_write_failures_after_correlation_still_return_ok() {
    let srv = TestServer::spawn_with(|services, handles| {
        services.reconciler = Arc::new(WebhookReconciler::new(
            Arc::new(BrokenWrites(handles.calls.clone())),
            handles.jobs.clone(),
            Some(SECRET.to_string()),
            chrono::Duration::hours(48),
        ));
    })
    .await;
    let client = reqwest::Client::new();

    let now = Utc::now();
    let mut record = CallRecord::initiated(TaskId::new(), now);
    record.mark_dialed("CA42", Some("conv_42".to_string()), now);
    srv.handles.calls.create(&record).await.unwrap();

    let res = client
        .post(srv.url("/webhooks/voice"))
        .header("x-webhook-secret", SECRET)
        .body(
            json!({
                "type": "post_call_transcription",
                "data": {
                    "conversation_id": "conv_42",
                    "status": "done",
                    "transcript": [{ "role": "agent", "message": "Hello", "time_in_call_secs": 0.5 }]
                }
            })
            .to_string(),
        )
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let ack: serde_json::Value = res.json().await.unwrap();
    assert_eq!(ack["status"], "degraded");
    assert_eq!(ack["call_record_id"], record.id.to_string().as_str());
    assert_eq!(ack["failed_steps"], json!(["replace_transcript", "update_record"]));

    // The metadata snapshot still landed.
    let stored = srv.handles.calls.get(record.id).await.unwrap().unwrap();
    assert_eq!(stored.metadata.len(), 1);
}
