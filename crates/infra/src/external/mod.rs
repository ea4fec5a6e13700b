//! Collaborators outside this service: the CRM contact directory, the voice
//! dialer, the provider's conversation API and the downstream analysis step.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use dialback_core::CallRecordId;
use dialback_followups::TargetRef;

pub mod http;
pub mod in_memory;
pub mod postgres;

pub use http::{HttpAnalysis, HttpConversationFetcher, HttpDialer};
pub use in_memory::{InMemoryContactDirectory, LoggingAnalysis, ScriptedDialer, StaticConversationFetcher};
pub use postgres::PostgresContactDirectory;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExternalError {
    #[error("network error: {0}")]
    Network(String),
    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl ExternalError {
    /// Network failures and 5xx responses are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            ExternalError::Network(_) | ExternalError::Storage(_) => true,
            ExternalError::Upstream { status, .. } => *status >= 500 || *status == 429,
            ExternalError::Decode(_) => false,
        }
    }
}

/// A resolved lead or applicant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub name: Option<String>,
    pub phone: Option<String>,
}

impl Contact {
    /// Trimmed, non-empty phone number.
    pub fn phone(&self) -> Option<&str> {
        self.phone.as_deref().map(str::trim).filter(|p| !p.is_empty())
    }
}

#[async_trait]
pub trait ContactDirectory: Send + Sync {
    /// `None` when the lead or applicant no longer exists.
    async fn resolve(&self, target: &TargetRef) -> Result<Option<Contact>, ExternalError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DialRequest {
    pub phone: String,
    pub contact_name: Option<String>,
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DialReceipt {
    pub provider_call_id: String,
    pub conversation_id: Option<String>,
    /// Response body as returned by the dialer, archived on the call record.
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DialError {
    #[error("transient dialer failure: {0}")]
    Transient(String),
    #[error("dialer rejected the call: {0}")]
    Rejected(String),
}

impl From<ExternalError> for DialError {
    fn from(err: ExternalError) -> Self {
        if err.is_transient() {
            DialError::Transient(err.to_string())
        } else {
            DialError::Rejected(err.to_string())
        }
    }
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn place_call(&self, request: &DialRequest) -> Result<DialReceipt, DialError>;
}

#[async_trait]
pub trait ConversationFetcher: Send + Sync {
    /// Full conversation payload for a conversation id.
    async fn fetch(&self, conversation_id: &str) -> Result<Value, ExternalError>;
}

#[async_trait]
pub trait Analysis: Send + Sync {
    async fn analyze(&self, call_record_id: CallRecordId) -> Result<(), ExternalError>;
}
