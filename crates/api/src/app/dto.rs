use std::str::FromStr;

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use dialback_calls::{CallRecord, TranscriptTurn};
use dialback_core::TaskId;
use dialback_followups::{Channel, FollowUpTask, Priority, TargetKind, TargetRef, TaskStatus, resolve};

use crate::app::errors::{self, domain_error_to_response};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub target_kind: String,
    pub target_id: String,
    pub channel: Option<String>,
    /// RFC 3339 timestamp. Takes precedence over `timing`.
    pub due_at: Option<String>,
    /// Free-form timing text, e.g. "in 2 hours" or "tomorrow".
    pub timing: Option<String>,
    pub notes: Option<String>,
    pub priority: Option<String>,
    pub context: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct EnrichContextRequest {
    pub context: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct PurgeCallsRequest {
    pub before: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct CreatedTask {
    pub id: TaskId,
    pub due_at: DateTime<Utc>,
    pub status: TaskStatus,
}

impl From<&FollowUpTask> for CreatedTask {
    fn from(task: &FollowUpTask) -> Self {
        Self {
            id: task.id,
            due_at: task.due_at,
            status: task.status,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CallRecordView {
    #[serde(flatten)]
    pub record: CallRecord,
    pub transcript: Vec<TranscriptTurn>,
}

// -------------------------
// Mapping helpers
// -------------------------

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 500;

pub fn list_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

pub fn parse_uuid(s: &str, what: &'static str) -> Result<Uuid, axum::response::Response> {
    Uuid::parse_str(s.trim()).map_err(|_| {
        errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("{what} must be a UUID"))
    })
}

pub fn parse_task_id(s: &str) -> Result<TaskId, axum::response::Response> {
    parse_uuid(s, "task id").map(TaskId::from_uuid)
}

pub fn parse_status(s: Option<&str>) -> Result<Option<TaskStatus>, axum::response::Response> {
    s.map(TaskStatus::from_str)
        .transpose()
        .map_err(domain_error_to_response)
}

impl CreateTaskRequest {
    /// Validate the request and build a new pending task.
    pub fn into_task(self, now: DateTime<Utc>) -> Result<FollowUpTask, axum::response::Response> {
        let kind = TargetKind::from_str(&self.target_kind).map_err(domain_error_to_response)?;
        let target = TargetRef::new(kind, parse_uuid(&self.target_id, "target_id")?);

        let channel = match self.channel.as_deref() {
            Some(c) => Channel::from_str(c).map_err(domain_error_to_response)?,
            None => Channel::VoiceCall,
        };

        let due_at = match (self.due_at.as_deref(), self.timing.as_deref()) {
            (Some(raw), _) => DateTime::parse_from_rfc3339(raw.trim())
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| {
                    errors::json_error(
                        StatusCode::BAD_REQUEST,
                        "invalid_due_at",
                        "due_at must be an RFC 3339 timestamp",
                    )
                })?,
            (None, Some(timing)) => resolve(timing, now),
            (None, None) => resolve("now", now),
        };

        let mut task = FollowUpTask::new(target, channel, due_at, now);
        if let Some(priority) = self.priority.as_deref() {
            task = task.with_priority(Priority::from_str(priority).map_err(domain_error_to_response)?);
        }
        if let Some(notes) = self.notes {
            task = task.with_notes(notes);
        }
        if let Some(context) = self.context {
            task = task.with_context(context);
        }
        Ok(task)
    }
}
