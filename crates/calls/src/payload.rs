//! Provider payload normalization.
//!
//! Voice providers disagree on field names and nesting. Every field is looked
//! up under a list of aliases, first at the top level and then under `data`,
//! `metadata`, `data.metadata` and the nested `phone_call` objects. Lookups
//! never fail: a missing or mistyped field is simply absent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::CallStatus;
use crate::transcript::TurnInput;

const CONVERSATION_ID_KEYS: &[&str] = &["conversation_id", "conversationId"];
const CALL_ID_KEYS: &[&str] = &["call_id", "callId", "call_sid", "callSid", "external_call_id"];
const RECORDING_KEYS: &[&str] = &["recording_url", "recordingUrl", "audio_url"];
const STATUS_KEYS: &[&str] = &["status", "call_status"];
const EVENT_TYPE_KEYS: &[&str] = &["type", "event_type", "event"];
const COST_KEYS: &[&str] = &["cost", "call_cost", "total_cost"];
const DURATION_KEYS: &[&str] = &["duration", "duration_seconds", "call_duration_secs"];

const SPEAKER_KEYS: &[&str] = &["speaker", "role"];
const TEXT_KEYS: &[&str] = &["text", "message", "content"];
const OFFSET_KEYS: &[&str] = &["time_offset_seconds", "time_in_call_secs", "time_offset", "start"];

/// A provider event in canonical shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub event_type: Option<String>,
    pub conversation_id: Option<String>,
    pub call_id: Option<String>,
    pub recording_url: Option<String>,
    pub status: Option<String>,
    pub cost: Option<f64>,
    pub duration_seconds: Option<f64>,
    /// Turns in payload order.
    pub turns: Vec<TurnInput>,
    /// The payload announces a conversation whose transcript is not included.
    pub preview: bool,
}

impl ProviderEvent {
    pub fn from_json(root: &Value) -> Self {
        let data = root.get("data");
        let mut scopes: Vec<&Value> = vec![root];
        scopes.extend(data);
        for scope in [Some(root), data].into_iter().flatten() {
            if let Some(metadata) = scope.get("metadata") {
                scopes.push(metadata);
                scopes.extend(metadata.get("phone_call"));
            }
        }

        let transcript = lookup(&scopes, &["transcript"]);
        let turns = transcript
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(turn_from_json).collect())
            .unwrap_or_default();

        let event_type = lookup_string(&scopes, EVENT_TYPE_KEYS);
        let preview = transcript.is_some_and(Value::is_string)
            || lookup(&scopes, &["transcript_preview"]).is_some()
            || lookup(&scopes, &["has_transcript"]).and_then(Value::as_bool) == Some(false)
            || event_type
                .as_deref()
                .is_some_and(|t| t.to_lowercase().contains("preview"));

        Self {
            event_type,
            conversation_id: lookup_string(&scopes, CONVERSATION_ID_KEYS),
            call_id: lookup_string(&scopes, CALL_ID_KEYS),
            recording_url: lookup_string(&scopes, RECORDING_KEYS),
            status: lookup_string(&scopes, STATUS_KEYS),
            cost: lookup_f64(&scopes, COST_KEYS),
            duration_seconds: lookup_f64(&scopes, DURATION_KEYS),
            turns,
            preview,
        }
    }

    pub fn call_status(&self) -> Option<CallStatus> {
        self.status.as_deref().and_then(CallStatus::from_provider)
    }

    pub fn has_transcript(&self) -> bool {
        !self.turns.is_empty()
    }

    /// The full conversation has to be retrieved separately.
    ///
    /// True when no turns came along but the payload names a conversation and
    /// either says it is a preview or reports the call as finished.
    pub fn needs_fetch(&self) -> bool {
        !self.has_transcript()
            && self.conversation_id.is_some()
            && (self.preview || self.call_status().is_some_and(|s| s.is_terminal()))
    }

    /// Identifiers worth scanning archived metadata for, most specific first.
    pub fn correlation_needles(&self) -> Vec<&str> {
        [self.call_id.as_deref(), self.conversation_id.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect()
    }
}

fn turn_from_json(item: &Value) -> Option<TurnInput> {
    let scope = [item];
    let text = lookup_string(&scope, TEXT_KEYS)?;
    let speaker = lookup_string(&scope, SPEAKER_KEYS).unwrap_or_else(|| "unknown".to_string());
    Some(TurnInput::new(speaker, text, lookup_f64(&scope, OFFSET_KEYS)))
}

fn lookup<'a>(scopes: &[&'a Value], keys: &[&str]) -> Option<&'a Value> {
    scopes
        .iter()
        .flat_map(|scope| keys.iter().filter_map(move |key| scope.get(*key)))
        .find(|value| !value.is_null())
}

fn lookup_string(scopes: &[&Value], keys: &[&str]) -> Option<String> {
    scopes
        .iter()
        .flat_map(|scope| keys.iter().filter_map(move |key| scope.get(*key)))
        .find_map(|value| match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn lookup_f64(scopes: &[&Value], keys: &[&str]) -> Option<f64> {
    scopes
        .iter()
        .flat_map(|scope| keys.iter().filter_map(move |key| scope.get(*key)))
        .find_map(|value| match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        })
        .filter(|v| v.is_finite())
}
