//! Postgres-backed call store.
//!
//! Metadata snapshots live in a `jsonb` array that is only ever extended with
//! `metadata || …`; scalar updates never rewrite it. Transcript replacement
//! runs in one transaction holding the call record row, so two replays of the
//! same payload serialize instead of interleaving their delete/insert.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::{Span, instrument};
use uuid::Uuid;

use dialback_calls::{CallRecord, MetadataSnapshot, TranscriptTurn};
use dialback_core::{CallRecordId, DomainError, TaskId};

use super::{CallStore, CallStoreError};

const RECORD_COLUMNS: &str = r#"
    id, task_id, external_call_id, conversation_id, status, duration_seconds, cost,
    recording_url, diagnostic, fetch_pending, metadata, created_at, updated_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresCallStore {
    pool: Arc<PgPool>,
}

impl PostgresCallStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    async fn fetch_one_where(
        &self,
        operation: &str,
        predicate: &str,
        bind: &str,
    ) -> Result<Option<CallRecord>, CallStoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM call_records WHERE {predicate} ORDER BY updated_at DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(bind)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        row.map(|r| record_from_row(&r))
            .transpose()
            .map_err(|e| map_sqlx_error(operation, e))
    }
}

#[async_trait]
impl CallStore for PostgresCallStore {
    #[instrument(skip(self, record), fields(call_record_id = %record.id), err)]
    async fn create(&self, record: &CallRecord) -> Result<(), CallStoreError> {
        let metadata = serde_json::to_value(&record.metadata)
            .map_err(|e| CallStoreError::Storage(format!("failed to encode metadata: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO call_records (
                id, task_id, external_call_id, conversation_id, status, duration_seconds, cost,
                recording_url, diagnostic, fetch_pending, metadata, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.task_id.map(|id| *id.as_uuid()))
        .bind(&record.external_call_id)
        .bind(&record.conversation_id)
        .bind(record.status.as_str())
        .bind(record.duration_seconds)
        .bind(record.cost)
        .bind(&record.recording_url)
        .bind(record.diagnostic)
        .bind(record.fetch_pending)
        .bind(metadata)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| match map_sqlx_error("create", e) {
            CallStoreError::Domain(DomainError::Conflict(_)) => CallStoreError::AlreadyExists(record.id),
            other => other,
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(call_record_id = %id), err)]
    async fn get(&self, id: CallRecordId) -> Result<Option<CallRecord>, CallStoreError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM call_records WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(|r| record_from_row(&r))
            .transpose()
            .map_err(|e| map_sqlx_error("get", e))
    }

    #[instrument(skip(self), err)]
    async fn find_by_external_call_id(&self, call_id: &str) -> Result<Option<CallRecord>, CallStoreError> {
        self.fetch_one_where("find_by_external_call_id", "external_call_id = $1", call_id)
            .await
    }

    #[instrument(skip(self), err)]
    async fn find_by_conversation_id(&self, conversation_id: &str) -> Result<Option<CallRecord>, CallStoreError> {
        self.fetch_one_where("find_by_conversation_id", "conversation_id = $1", conversation_id)
            .await
    }

    #[instrument(skip(self), err)]
    async fn find_by_metadata_mention(
        &self,
        needle: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<CallRecord>, CallStoreError> {
        if needle.is_empty() {
            return Ok(None);
        }
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM call_records
            WHERE updated_at >= $2
              AND metadata::text LIKE '%' || $1 || '%' ESCAPE '\'
            ORDER BY updated_at DESC, id DESC
            LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(escape_like(needle))
            .bind(since)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_metadata_mention", e))?;
        row.map(|r| record_from_row(&r))
            .transpose()
            .map_err(|e| map_sqlx_error("find_by_metadata_mention", e))
    }

    #[instrument(skip(self, snapshot), fields(call_record_id = %id, source = ?snapshot.source), err)]
    async fn append_metadata(&self, id: CallRecordId, snapshot: &MetadataSnapshot) -> Result<(), CallStoreError> {
        let snapshot_json = serde_json::to_value(snapshot)
            .map_err(|e| CallStoreError::Storage(format!("failed to encode snapshot: {e}")))?;
        let result = sqlx::query(
            r#"
            UPDATE call_records
            SET metadata = metadata || jsonb_build_array($2::jsonb),
                updated_at = GREATEST(updated_at, $3)
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(snapshot_json)
        .bind(snapshot.received_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_metadata", e))?;

        if result.rows_affected() == 0 {
            return Err(CallStoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self, record), fields(call_record_id = %record.id, status = %record.status), err)]
    async fn update(&self, record: &CallRecord) -> Result<(), CallStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE call_records SET
                task_id = $2,
                external_call_id = $3,
                conversation_id = $4,
                status = $5,
                duration_seconds = $6,
                cost = $7,
                recording_url = $8,
                diagnostic = $9,
                fetch_pending = $10,
                updated_at = $11
            WHERE id = $1
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.task_id.map(|id| *id.as_uuid()))
        .bind(&record.external_call_id)
        .bind(&record.conversation_id)
        .bind(record.status.as_str())
        .bind(record.duration_seconds)
        .bind(record.cost)
        .bind(&record.recording_url)
        .bind(record.diagnostic)
        .bind(record.fetch_pending)
        .bind(record.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() == 0 {
            return Err(CallStoreError::NotFound(record.id));
        }
        Ok(())
    }

    #[instrument(skip(self, turns), fields(call_record_id = %id, turns = turns.len(), stored), err)]
    async fn replace_transcript(&self, id: CallRecordId, turns: &[TranscriptTurn]) -> Result<u64, CallStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("replace_transcript", e))?;

        let held = sqlx::query("SELECT id FROM call_records WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("replace_transcript", e))?;
        if held.is_none() {
            return Err(CallStoreError::NotFound(id));
        }

        sqlx::query("DELETE FROM transcript_turns WHERE call_record_id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("replace_transcript", e))?;

        let mut stored = 0;
        for turn in turns {
            let result = sqlx::query(
                r#"
                INSERT INTO transcript_turns (call_record_id, position, speaker, text, time_offset_seconds)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (call_record_id, text) DO NOTHING
                "#,
            )
            .bind(id.as_uuid())
            .bind(turn.position as i32)
            .bind(&turn.speaker)
            .bind(&turn.text)
            .bind(turn.time_offset_seconds)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("replace_transcript", e))?;
            stored += result.rows_affected();
        }

        tx.commit().await.map_err(|e| map_sqlx_error("replace_transcript", e))?;
        Span::current().record("stored", stored);
        Ok(stored)
    }

    #[instrument(skip(self), fields(call_record_id = %id), err)]
    async fn transcript(&self, id: CallRecordId) -> Result<Vec<TranscriptTurn>, CallStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT position, speaker, text, time_offset_seconds
            FROM transcript_turns
            WHERE call_record_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transcript", e))?;

        rows.iter()
            .map(|row| -> Result<TranscriptTurn, sqlx::Error> {
                let position: i32 = row.try_get("position")?;
                Ok(TranscriptTurn {
                    position: position.max(0) as u32,
                    speaker: row.try_get("speaker")?,
                    text: row.try_get("text")?,
                    time_offset_seconds: row.try_get("time_offset_seconds")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(|e| map_sqlx_error("transcript", e))
    }

    #[instrument(skip(self, body), fields(bytes = body.len()), err)]
    async fn archive_payload(&self, body: &str, received_at: DateTime<Utc>) -> Result<Uuid, CallStoreError> {
        let id = Uuid::now_v7();
        sqlx::query("INSERT INTO webhook_archive (id, received_at, body) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(received_at)
            .bind(body)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("archive_payload", e))?;
        Ok(id)
    }

    #[instrument(skip(self), err)]
    async fn purge_before(&self, before: DateTime<Utc>) -> Result<u64, CallStoreError> {
        let result = sqlx::query("DELETE FROM call_records WHERE created_at < $1")
            .bind(before)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_before", e))?;
        Ok(result.rows_affected())
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<CallRecord, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let task_id: Option<Uuid> = row.try_get("task_id")?;
    let metadata: Value = row.try_get("metadata")?;

    Ok(CallRecord {
        id: CallRecordId::from_uuid(row.try_get("id")?),
        task_id: task_id.map(TaskId::from_uuid),
        external_call_id: row.try_get("external_call_id")?,
        conversation_id: row.try_get("conversation_id")?,
        status: status.parse().map_err(|e: DomainError| sqlx::Error::ColumnDecode {
            index: "status".to_string(),
            source: Box::new(e),
        })?,
        duration_seconds: row.try_get("duration_seconds")?,
        cost: row.try_get("cost")?,
        recording_url: row.try_get("recording_url")?,
        diagnostic: row.try_get("diagnostic")?,
        fetch_pending: row.try_get("fetch_pending")?,
        metadata: serde_json::from_value(metadata).map_err(|e| sqlx::Error::ColumnDecode {
            index: "metadata".to_string(),
            source: Box::new(e),
        })?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Escape `%`, `_` and the escape character itself for a LIKE pattern.
fn escape_like(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len());
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Map SQLx errors to CallStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> CallStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => CallStoreError::Domain(DomainError::conflict(msg)),
                Some("23514") => CallStoreError::Domain(DomainError::invariant(msg)),
                _ => CallStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => CallStoreError::Storage(format!("connection pool closed in {}", operation)),
        other => CallStoreError::Storage(format!("sqlx error in {}: {}", operation, other)),
    }
}
