use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use dialback_core::{CallRecordId, DomainError, TaskId};

use crate::payload::ProviderEvent;

/// Lifecycle status of an outbound call.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiated,
    InProgress,
    Completed,
    Failed,
    NoAnswer,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Initiated => "initiated",
            CallStatus::InProgress => "in_progress",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
            CallStatus::NoAnswer => "no_answer",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Completed | CallStatus::Failed | CallStatus::NoAnswer)
    }

    /// Map a provider status string onto a call status.
    pub fn from_provider(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().replace('-', "_").as_str() {
            "initiated" | "queued" | "created" => Some(CallStatus::Initiated),
            "in_progress" | "processing" | "ringing" | "answered" | "ongoing" => {
                Some(CallStatus::InProgress)
            }
            "done" | "completed" | "ended" | "success" | "finished" => Some(CallStatus::Completed),
            "failed" | "error" | "canceled" | "cancelled" => Some(CallStatus::Failed),
            "no_answer" | "busy" | "voicemail" => Some(CallStatus::NoAnswer),
            _ => None,
        }
    }
}

impl core::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(CallStatus::Initiated),
            "in_progress" => Ok(CallStatus::InProgress),
            "completed" => Ok(CallStatus::Completed),
            "failed" => Ok(CallStatus::Failed),
            "no_answer" => Ok(CallStatus::NoAnswer),
            other => Err(DomainError::validation(format!("unknown call status '{other}'"))),
        }
    }
}

/// Where an archived metadata snapshot came from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    Dialer,
    Webhook,
    Fetch,
}

/// One archived provider payload. Snapshots are only ever appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    pub received_at: DateTime<Utc>,
    pub source: SnapshotSource,
    pub payload: Value,
}

impl MetadataSnapshot {
    pub fn new(source: SnapshotSource, payload: Value, received_at: DateTime<Utc>) -> Self {
        Self {
            received_at,
            source,
            payload,
        }
    }
}

/// An outbound call and everything learned about it from the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: CallRecordId,
    pub task_id: Option<TaskId>,
    pub external_call_id: Option<String>,
    pub conversation_id: Option<String>,
    pub status: CallStatus,
    pub duration_seconds: Option<f64>,
    pub cost: Option<f64>,
    pub recording_url: Option<String>,
    /// Created from an event that matched no known call.
    pub diagnostic: bool,
    /// The full conversation still has to be retrieved from the provider.
    pub fetch_pending: bool,
    pub metadata: Vec<MetadataSnapshot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CallRecord {
    /// Record created by the execution worker right before dialing.
    pub fn initiated(task_id: TaskId, now: DateTime<Utc>) -> Self {
        Self::blank(Some(task_id), false, now)
    }

    /// Placeholder for an event that could not be correlated.
    pub fn diagnostic(event: &ProviderEvent, now: DateTime<Utc>) -> Self {
        let mut record = Self::blank(None, true, now);
        record.external_call_id = event.call_id.clone();
        record.conversation_id = event.conversation_id.clone();
        record
    }

    fn blank(task_id: Option<TaskId>, diagnostic: bool, now: DateTime<Utc>) -> Self {
        Self {
            id: CallRecordId::new(),
            task_id,
            external_call_id: None,
            conversation_id: None,
            status: CallStatus::Initiated,
            duration_seconds: None,
            cost: None,
            recording_url: None,
            diagnostic,
            fetch_pending: false,
            metadata: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// The dialer accepted the call.
    pub fn mark_dialed(
        &mut self,
        provider_call_id: impl Into<String>,
        conversation_id: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.external_call_id = Some(provider_call_id.into());
        if conversation_id.is_some() {
            self.conversation_id = conversation_id;
        }
        self.status = CallStatus::InProgress;
        self.updated_at = now;
    }

    pub fn mark_dial_failed(&mut self, now: DateTime<Utc>) {
        self.status = CallStatus::Failed;
        self.updated_at = now;
    }

    /// Fold the scalar fields of a provider event into the record.
    ///
    /// Correlation ids are only filled in, never replaced. A terminal status
    /// is never regressed by a late non-terminal event.
    pub fn apply_event(&mut self, event: &ProviderEvent, now: DateTime<Utc>) {
        if self.external_call_id.is_none() {
            self.external_call_id = event.call_id.clone();
        }
        if self.conversation_id.is_none() {
            self.conversation_id = event.conversation_id.clone();
        }
        if let Some(status) = event.call_status() {
            if !self.status.is_terminal() || status.is_terminal() {
                self.status = status;
            }
        }
        if event.duration_seconds.is_some() {
            self.duration_seconds = event.duration_seconds;
        }
        if event.cost.is_some() {
            self.cost = event.cost;
        }
        if event.recording_url.is_some() {
            self.recording_url = event.recording_url.clone();
        }
        self.updated_at = now;
    }

    /// Best-effort substring match over every archived payload.
    pub fn metadata_mentions(&self, needle: &str) -> bool {
        if needle.is_empty() {
            return false;
        }
        self.metadata
            .iter()
            .any(|snapshot| snapshot.payload.to_string().contains(needle))
    }
}
