use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use dialback_followups::{TargetKind, TargetRef};

use super::{Contact, ContactDirectory, ExternalError};

/// Reads contacts from the CRM `leads` and `applicants` tables.
#[derive(Debug, Clone)]
pub struct PostgresContactDirectory {
    pool: Arc<PgPool>,
}

impl PostgresContactDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

#[async_trait]
impl ContactDirectory for PostgresContactDirectory {
    #[instrument(skip(self), fields(target = %target), err)]
    async fn resolve(&self, target: &TargetRef) -> Result<Option<Contact>, ExternalError> {
        let sql = match target.kind() {
            TargetKind::Lead => "SELECT name, phone FROM leads WHERE id = $1",
            TargetKind::Applicant => "SELECT name, phone FROM applicants WHERE id = $1",
        };
        let row = sqlx::query(sql)
            .bind(target.id())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| ExternalError::Storage(format!("contact lookup failed: {e}")))?;

        row.map(|r| -> Result<Contact, sqlx::Error> {
            Ok(Contact {
                name: r.try_get("name")?,
                phone: r.try_get("phone")?,
            })
        })
        .transpose()
        .map_err(|e| ExternalError::Storage(format!("failed to decode contact: {e}")))
    }
}
