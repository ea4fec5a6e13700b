//! Durable storage for call records, transcripts and the raw webhook archive.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use dialback_calls::{CallRecord, MetadataSnapshot, TranscriptTurn};
use dialback_core::{CallRecordId, DomainError};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryCallStore;
pub use postgres::PostgresCallStore;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CallStoreError {
    #[error("call record not found: {0}")]
    NotFound(CallRecordId),
    #[error("call record already exists: {0}")]
    AlreadyExists(CallRecordId),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// A webhook body stored verbatim before any parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchivedPayload {
    pub id: Uuid,
    pub received_at: DateTime<Utc>,
    pub body: String,
}

#[async_trait]
pub trait CallStore: Send + Sync {
    async fn create(&self, record: &CallRecord) -> Result<(), CallStoreError>;

    async fn get(&self, id: CallRecordId) -> Result<Option<CallRecord>, CallStoreError>;

    /// Most recently updated record with this provider call id.
    async fn find_by_external_call_id(&self, call_id: &str) -> Result<Option<CallRecord>, CallStoreError>;

    /// Most recently updated record with this conversation id.
    async fn find_by_conversation_id(&self, conversation_id: &str) -> Result<Option<CallRecord>, CallStoreError>;

    /// Substring scan over archived metadata of records updated at or after
    /// `since`. Best effort: payloads that spell the id differently are missed.
    async fn find_by_metadata_mention(
        &self,
        needle: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<CallRecord>, CallStoreError>;

    /// Append one snapshot to the record's metadata in a single atomic update.
    async fn append_metadata(&self, id: CallRecordId, snapshot: &MetadataSnapshot) -> Result<(), CallStoreError>;

    /// Persist the record's scalar fields. Metadata is left untouched.
    async fn update(&self, record: &CallRecord) -> Result<(), CallStoreError>;

    /// Replace the record's transcript with `turns`. Returns the number stored.
    async fn replace_transcript(&self, id: CallRecordId, turns: &[TranscriptTurn]) -> Result<u64, CallStoreError>;

    async fn transcript(&self, id: CallRecordId) -> Result<Vec<TranscriptTurn>, CallStoreError>;

    async fn archive_payload(&self, body: &str, received_at: DateTime<Utc>) -> Result<Uuid, CallStoreError>;

    /// Bulk administrative purge of records created before `before`.
    async fn purge_before(&self, before: DateTime<Utc>) -> Result<u64, CallStoreError>;
}
