//! In-process collaborators for dev and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use dialback_core::CallRecordId;
use dialback_followups::TargetRef;

use super::{
    Analysis, Contact, ContactDirectory, ConversationFetcher, DialError, DialReceipt, DialRequest, Dialer,
    ExternalError,
};

fn poisoned() -> ExternalError {
    ExternalError::Storage("collaborator lock poisoned".to_string())
}

#[derive(Debug, Default)]
pub struct InMemoryContactDirectory {
    contacts: Mutex<HashMap<TargetRef, Contact>>,
}

impl InMemoryContactDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, target: TargetRef, contact: Contact) -> Result<(), ExternalError> {
        self.contacts.lock().map_err(|_| poisoned())?.insert(target, contact);
        Ok(())
    }

    pub fn remove(&self, target: &TargetRef) -> Result<Option<Contact>, ExternalError> {
        Ok(self.contacts.lock().map_err(|_| poisoned())?.remove(target))
    }
}

#[async_trait]
impl ContactDirectory for InMemoryContactDirectory {
    async fn resolve(&self, target: &TargetRef) -> Result<Option<Contact>, ExternalError> {
        Ok(self.contacts.lock().map_err(|_| poisoned())?.get(target).cloned())
    }
}

/// Dialer that replays scripted outcomes, then succeeds.
///
/// Every request is recorded. Without a script it behaves as a dialer that
/// accepts every call, which is also what the service uses when no dialer URL
/// is configured.
#[derive(Debug, Default)]
pub struct ScriptedDialer {
    script: Mutex<VecDeque<Result<DialReceipt, DialError>>>,
    calls: Mutex<Vec<DialRequest>>,
}

impl ScriptedDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next call.
    pub fn push(&self, outcome: Result<DialReceipt, DialError>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(outcome);
        }
    }

    /// Queue `n` identical transient failures.
    pub fn fail_transiently(&self, n: usize, reason: &str) {
        for _ in 0..n {
            self.push(Err(DialError::Transient(reason.to_string())));
        }
    }

    pub fn calls(&self) -> Vec<DialRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    async fn place_call(&self, request: &DialRequest) -> Result<DialReceipt, DialError> {
        let (n, scripted) = {
            let mut calls = self
                .calls
                .lock()
                .map_err(|_| DialError::Transient("dialer lock poisoned".to_string()))?;
            calls.push(request.clone());
            let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
            (calls.len(), scripted)
        };

        match scripted {
            Some(outcome) => outcome,
            None => {
                let provider_call_id = format!("sim-call-{n}");
                let conversation_id = format!("sim-conv-{n}");
                Ok(DialReceipt {
                    raw: json!({
                        "call_id": provider_call_id,
                        "conversation_id": conversation_id,
                        "simulated": true,
                    }),
                    provider_call_id,
                    conversation_id: Some(conversation_id),
                })
            }
        }
    }
}

/// Serves conversations from a fixed map.
#[derive(Debug, Default)]
pub struct StaticConversationFetcher {
    conversations: Mutex<HashMap<String, Value>>,
}

impl StaticConversationFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conversation_id: impl Into<String>, payload: Value) {
        if let Ok(mut conversations) = self.conversations.lock() {
            conversations.insert(conversation_id.into(), payload);
        }
    }
}

#[async_trait]
impl ConversationFetcher for StaticConversationFetcher {
    async fn fetch(&self, conversation_id: &str) -> Result<Value, ExternalError> {
        self.conversations
            .lock()
            .map_err(|_| poisoned())?
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| ExternalError::Upstream {
                status: 404,
                body: format!("conversation {conversation_id} not found"),
            })
    }
}

/// Analysis step that only logs and remembers which calls it saw.
#[derive(Debug, Default)]
pub struct LoggingAnalysis {
    seen: Mutex<Vec<CallRecordId>>,
}

impl LoggingAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn analyzed(&self) -> Vec<CallRecordId> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Analysis for LoggingAnalysis {
    async fn analyze(&self, call_record_id: CallRecordId) -> Result<(), ExternalError> {
        info!(call_record_id = %call_record_id, "analysis requested");
        self.seen.lock().map_err(|_| poisoned())?.push(call_record_id);
        Ok(())
    }
}
