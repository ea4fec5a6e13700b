use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use dialback_calls::{CallRecord, MetadataSnapshot, TranscriptTurn};
use dialback_core::CallRecordId;

use super::{ArchivedPayload, CallStore, CallStoreError};

#[derive(Debug, Default)]
struct State {
    records: HashMap<CallRecordId, CallRecord>,
    transcripts: HashMap<CallRecordId, Vec<TranscriptTurn>>,
    archive: Vec<ArchivedPayload>,
}

/// In-memory call store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCallStore {
    state: Mutex<State>,
}

impl InMemoryCallStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Every archived webhook body, oldest first.
    pub fn archived(&self) -> Result<Vec<ArchivedPayload>, CallStoreError> {
        Ok(self.state.lock()?.archive.clone())
    }

    /// All records, oldest first.
    pub fn records(&self) -> Result<Vec<CallRecord>, CallStoreError> {
        let state = self.state.lock()?;
        let mut out: Vec<_> = state.records.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    fn most_recent<F>(&self, predicate: F) -> Result<Option<CallRecord>, CallStoreError>
    where
        F: Fn(&CallRecord) -> bool,
    {
        let state = self.state.lock()?;
        Ok(state
            .records
            .values()
            .filter(|r| predicate(r))
            .max_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)))
            .cloned())
    }
}

impl<T> From<PoisonError<T>> for CallStoreError {
    fn from(_: PoisonError<T>) -> Self {
        CallStoreError::Storage("call store lock poisoned".to_string())
    }
}

#[async_trait]
impl CallStore for InMemoryCallStore {
    async fn create(&self, record: &CallRecord) -> Result<(), CallStoreError> {
        let mut state = self.state.lock()?;
        if state.records.contains_key(&record.id) {
            return Err(CallStoreError::AlreadyExists(record.id));
        }
        state.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: CallRecordId) -> Result<Option<CallRecord>, CallStoreError> {
        Ok(self.state.lock()?.records.get(&id).cloned())
    }

    async fn find_by_external_call_id(&self, call_id: &str) -> Result<Option<CallRecord>, CallStoreError> {
        self.most_recent(|r| r.external_call_id.as_deref() == Some(call_id))
    }

    async fn find_by_conversation_id(&self, conversation_id: &str) -> Result<Option<CallRecord>, CallStoreError> {
        self.most_recent(|r| r.conversation_id.as_deref() == Some(conversation_id))
    }

    async fn find_by_metadata_mention(
        &self,
        needle: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<CallRecord>, CallStoreError> {
        self.most_recent(|r| r.updated_at >= since && r.metadata_mentions(needle))
    }

    async fn append_metadata(&self, id: CallRecordId, snapshot: &MetadataSnapshot) -> Result<(), CallStoreError> {
        let mut state = self.state.lock()?;
        let record = state.records.get_mut(&id).ok_or(CallStoreError::NotFound(id))?;
        record.metadata.push(snapshot.clone());
        record.updated_at = record.updated_at.max(snapshot.received_at);
        Ok(())
    }

    async fn update(&self, record: &CallRecord) -> Result<(), CallStoreError> {
        let mut state = self.state.lock()?;
        let stored = state.records.get_mut(&record.id).ok_or(CallStoreError::NotFound(record.id))?;
        let metadata = std::mem::take(&mut stored.metadata);
        *stored = CallRecord {
            metadata,
            ..record.clone()
        };
        Ok(())
    }

    async fn replace_transcript(&self, id: CallRecordId, turns: &[TranscriptTurn]) -> Result<u64, CallStoreError> {
        let mut state = self.state.lock()?;
        if !state.records.contains_key(&id) {
            return Err(CallStoreError::NotFound(id));
        }
        let mut stored: Vec<TranscriptTurn> = Vec::with_capacity(turns.len());
        for turn in turns {
            // Same uniqueness as the (call, text) constraint.
            if stored.iter().all(|t| t.text != turn.text) {
                stored.push(turn.clone());
            }
        }
        let count = stored.len() as u64;
        state.transcripts.insert(id, stored);
        Ok(count)
    }

    async fn transcript(&self, id: CallRecordId) -> Result<Vec<TranscriptTurn>, CallStoreError> {
        let state = self.state.lock()?;
        let mut turns = state.transcripts.get(&id).cloned().unwrap_or_default();
        turns.sort_by_key(|t| t.position);
        Ok(turns)
    }

    async fn archive_payload(&self, body: &str, received_at: DateTime<Utc>) -> Result<Uuid, CallStoreError> {
        let id = Uuid::now_v7();
        self.state.lock()?.archive.push(ArchivedPayload {
            id,
            received_at,
            body: body.to_string(),
        });
        Ok(id)
    }

    async fn purge_before(&self, before: DateTime<Utc>) -> Result<u64, CallStoreError> {
        let mut state = self.state.lock()?;
        let doomed: Vec<CallRecordId> = state
            .records
            .values()
            .filter(|r| r.created_at < before)
            .map(|r| r.id)
            .collect();
        for id in &doomed {
            state.records.remove(id);
            state.transcripts.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}
