//! Postgres-backed task store.
//!
//! ## Error Mapping
//!
//! | PostgreSQL Error Code | TaskStoreError | Scenario |
//! |-----------------------|----------------|----------|
//! | `23505` | `AlreadyExists` | Duplicate task id on insert |
//! | `55P03` | (claim only) `ClaimOutcome::Locked` | Another transaction holds the row |
//! | `23514` | `Domain(InvariantViolation)` | Row would break a CHECK constraint |
//! | Any other | `Storage` | Connection failures, pool closed, etc. |
//!
//! ## Claiming
//!
//! `claim` selects the row with `FOR UPDATE NOWAIT` inside a transaction, so a
//! worker never blocks behind another worker: the lock error is reported as
//! `Locked` and the caller skips the task.
//!
//! A successful claim stamps `claimed_at`. Later conditional writes compare
//! against that stamp, and `reap_expired_claims` returns claims older than the
//! cutoff to `pending`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use dialback_core::{CallRecordId, DomainError, TaskId};
use dialback_followups::{CLAIM_EXPIRED, FollowUpTask, TargetRef, TaskStatus};

use super::{ClaimOutcome, TaskStore, TaskStoreError, decide_claim};

const TASK_COLUMNS: &str = r#"
    id, lead_id, applicant_id, channel, due_at, status, completed, priority,
    notes, context, call_record_id, attempts, last_error, claimed_at, created_at, updated_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: Arc<PgPool>,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    async fn lock_row(
        tx: &mut Transaction<'_, Postgres>,
        id: TaskId,
        nowait: bool,
    ) -> Result<Option<FollowUpTask>, sqlx::Error> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM followup_tasks WHERE id = $1 FOR UPDATE{}",
            if nowait { " NOWAIT" } else { "" }
        );
        let row = sqlx::query(&sql).bind(id.as_uuid()).fetch_optional(&mut **tx).await?;
        row.map(|r| task_from_row(&r)).transpose()
    }

    async fn write_state(tx: &mut Transaction<'_, Postgres>, task: &FollowUpTask) -> Result<u64, sqlx::Error> {
        Self::write_state_where(tx, task, None).await
    }

    /// `UPDATE` the row, optionally only while it is the claim stamped `claimed_at`.
    async fn write_state_where(
        tx: &mut Transaction<'_, Postgres>,
        task: &FollowUpTask,
        claimed_at: Option<DateTime<Utc>>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE followup_tasks SET
                due_at = $2,
                status = $3,
                completed = $4,
                priority = $5,
                notes = $6,
                context = $7,
                call_record_id = $8,
                attempts = $9,
                last_error = $10,
                claimed_at = $11,
                updated_at = $12
            WHERE id = $1
              AND ($13::timestamptz IS NULL OR (status = 'in_progress' AND claimed_at = $13))
            "#,
        )
        .bind(task.id.as_uuid())
        .bind(task.due_at)
        .bind(task.status.as_str())
        .bind(task.completed)
        .bind(task.priority.as_str())
        .bind(&task.notes)
        .bind(Value::Object(task.context.clone()))
        .bind(task.call_record_id.map(|id| *id.as_uuid()))
        .bind(task.attempts as i32)
        .bind(&task.last_error)
        .bind(task.claimed_at)
        .bind(task.updated_at)
        .bind(claimed_at)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }

    /// Lock the row (waiting), apply `f`, persist. Used for operator actions.
    async fn modify<F>(&self, operation: &str, id: TaskId, f: F) -> Result<FollowUpTask, TaskStoreError>
    where
        F: FnOnce(&mut FollowUpTask) -> Result<(), DomainError> + Send,
    {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error(operation, e))?;
        let mut task = Self::lock_row(&mut tx, id, false)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?
            .ok_or(TaskStoreError::NotFound(id))?;

        f(&mut task)?;

        Self::write_state(&mut tx, &task).await.map_err(|e| map_sqlx_error(operation, e))?;
        tx.commit().await.map_err(|e| map_sqlx_error(operation, e))?;
        Ok(task)
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, task), fields(task_id = %task.id, target = %task.target), err)]
    async fn insert(&self, task: &FollowUpTask) -> Result<(), TaskStoreError> {
        sqlx::query(
            r#"
            INSERT INTO followup_tasks (
                id, lead_id, applicant_id, channel, due_at, status, completed, priority,
                notes, context, call_record_id, attempts, last_error, claimed_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(task.id.as_uuid())
        .bind(task.target.lead_id().map(|id| *id.as_uuid()))
        .bind(task.target.applicant_id().map(|id| *id.as_uuid()))
        .bind(task.channel.as_str())
        .bind(task.due_at)
        .bind(task.status.as_str())
        .bind(task.completed)
        .bind(task.priority.as_str())
        .bind(&task.notes)
        .bind(Value::Object(task.context.clone()))
        .bind(task.call_record_id.map(|id| *id.as_uuid()))
        .bind(task.attempts as i32)
        .bind(&task.last_error)
        .bind(task.claimed_at)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| match map_sqlx_error("insert", e) {
            TaskStoreError::Domain(DomainError::Conflict(_)) => TaskStoreError::AlreadyExists(task.id),
            other => other,
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn get(&self, id: TaskId) -> Result<Option<FollowUpTask>, TaskStoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM followup_tasks WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(|r| task_from_row(&r))
            .transpose()
            .map_err(|e| map_sqlx_error("get", e))
    }

    #[instrument(skip(self), err)]
    async fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<FollowUpTask>, TaskStoreError> {
        let sql = format!(
            r#"
            SELECT {TASK_COLUMNS} FROM followup_tasks
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(status.map(|s| s.as_str()))
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;
        rows.iter()
            .map(task_from_row)
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error("list", e))
    }

    #[instrument(skip(self), fields(found), err)]
    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<FollowUpTask>, TaskStoreError> {
        let sql = format!(
            r#"
            SELECT {TASK_COLUMNS} FROM followup_tasks
            WHERE completed = FALSE
              AND status IN ('pending', 'scheduled')
              AND channel IN ('voice_call', 'phone')
              AND due_at <= $1
            ORDER BY array_position(ARRAY['urgent', 'high', 'normal', 'low'], priority), due_at, id
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_due", e))?;

        Span::current().record("found", rows.len());
        rows.iter()
            .map(task_from_row)
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error("find_due", e))
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn mark_scheduled(&self, ids: &[TaskId], now: DateTime<Utc>) -> Result<u64, TaskStoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let result = sqlx::query(
            r#"
            UPDATE followup_tasks
            SET status = 'scheduled', updated_at = $2
            WHERE id = ANY($1) AND status = 'pending' AND completed = FALSE
            "#,
        )
        .bind(&ids)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_scheduled", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn claim(&self, id: TaskId, now: DateTime<Utc>) -> Result<ClaimOutcome, TaskStoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("claim", e))?;

        let mut task = match Self::lock_row(&mut tx, id, true).await {
            Ok(Some(task)) => task,
            Ok(None) => return Err(TaskStoreError::NotFound(id)),
            Err(e) if is_lock_not_available(&e) => return Ok(ClaimOutcome::Locked),
            Err(e) => return Err(map_sqlx_error("claim", e)),
        };

        if let Some(outcome) = decide_claim(&mut task, now)? {
            // Dropping the transaction rolls back and releases the row.
            return Ok(outcome);
        }

        Self::write_state(&mut tx, &task).await.map_err(|e| map_sqlx_error("claim", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("claim", e))?;
        Ok(ClaimOutcome::Claimed(task))
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, status = %task.status), err)]
    async fn save(&self, task: &FollowUpTask) -> Result<(), TaskStoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("save", e))?;
        let affected = Self::write_state(&mut tx, task).await.map_err(|e| map_sqlx_error("save", e))?;
        if affected == 0 {
            return Err(TaskStoreError::NotFound(task.id));
        }
        tx.commit().await.map_err(|e| map_sqlx_error("save", e))?;
        Ok(())
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, status = %task.status), err)]
    async fn save_if_claimed(&self, task: &FollowUpTask, claimed_at: DateTime<Utc>) -> Result<bool, TaskStoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("save_if_claimed", e))?;
        let affected = Self::write_state_where(&mut tx, task, Some(claimed_at))
            .await
            .map_err(|e| map_sqlx_error("save_if_claimed", e))?;
        if affected == 0 {
            let exists = sqlx::query("SELECT 1 FROM followup_tasks WHERE id = $1")
                .bind(task.id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("save_if_claimed", e))?;
            if exists.is_none() {
                return Err(TaskStoreError::NotFound(task.id));
            }
            return Ok(false);
        }
        tx.commit().await.map_err(|e| map_sqlx_error("save_if_claimed", e))?;
        Ok(true)
    }

    #[instrument(skip(self), fields(reaped), err)]
    async fn reap_expired_claims(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, TaskStoreError> {
        // SKIP LOCKED leaves claims that are mid-write to their owner.
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE followup_tasks
            SET status = 'pending', claimed_at = NULL, last_error = $3, updated_at = $2
            WHERE id IN (
                SELECT id FROM followup_tasks
                WHERE status = 'in_progress' AND COALESCE(claimed_at, updated_at) < $1
                ORDER BY id
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .bind(CLAIM_EXPIRED)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reap_expired_claims", e))?;

        Span::current().record("reaped", ids.len());
        let mut reaped: Vec<TaskId> = ids.into_iter().map(TaskId::from_uuid).collect();
        reaped.sort();
        Ok(reaped)
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn cancel(&self, id: TaskId, now: DateTime<Utc>) -> Result<FollowUpTask, TaskStoreError> {
        self.modify("cancel", id, |task| task.cancel(now)).await
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn make_due(&self, id: TaskId, now: DateTime<Utc>) -> Result<FollowUpTask, TaskStoreError> {
        self.modify("make_due", id, |task| task.pull_due_forward(now)).await
    }

    #[instrument(skip(self, enrichment), fields(task_id = %id, keys = enrichment.len()), err)]
    async fn enrich_context(
        &self,
        id: TaskId,
        enrichment: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<FollowUpTask, TaskStoreError> {
        self.modify("enrich_context", id, move |task| {
            task.enrich(enrichment, now);
            Ok(())
        })
        .await
    }
}

fn task_from_row(row: &sqlx::postgres::PgRow) -> Result<FollowUpTask, sqlx::Error> {
    let decode = |column: &str, e: DomainError| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    };

    let lead_id: Option<Uuid> = row.try_get("lead_id")?;
    let applicant_id: Option<Uuid> = row.try_get("applicant_id")?;
    let target = TargetRef::from_columns(lead_id, applicant_id).map_err(|e| decode("lead_id", e))?;

    let channel: String = row.try_get("channel")?;
    let status: String = row.try_get("status")?;
    let priority: String = row.try_get("priority")?;
    let context: Value = row.try_get("context")?;
    let call_record_id: Option<Uuid> = row.try_get("call_record_id")?;
    let attempts: i32 = row.try_get("attempts")?;

    Ok(FollowUpTask {
        id: TaskId::from_uuid(row.try_get("id")?),
        target,
        channel: channel.parse().map_err(|e| decode("channel", e))?,
        due_at: row.try_get("due_at")?,
        status: status.parse().map_err(|e| decode("status", e))?,
        completed: row.try_get("completed")?,
        priority: priority.parse().map_err(|e| decode("priority", e))?,
        notes: row.try_get("notes")?,
        context: match context {
            Value::Object(map) => map,
            _ => Map::new(),
        },
        call_record_id: call_record_id.map(CallRecordId::from_uuid),
        attempts: attempts.max(0) as u32,
        last_error: row.try_get("last_error")?,
        claimed_at: row.try_get("claimed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn is_lock_not_available(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "55P03";
        }
    }
    false
}

/// Map SQLx errors to TaskStoreError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> TaskStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => TaskStoreError::Domain(DomainError::conflict(msg)),
                Some("23514") => TaskStoreError::Domain(DomainError::invariant(msg)),
                _ => TaskStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => TaskStoreError::Storage(format!("connection pool closed in {}", operation)),
        other => TaskStoreError::Storage(format!("sqlx error in {}: {}", operation, other)),
    }
}
