use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    db::DbPool,
    store::{AuditEntry, AuditLog, StoreResult},
};

pub struct PgAuditLog {
    pool: DbPool,
}

impl PgAuditLog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditLog for PgAuditLog {
    async fn record(&self, entry: AuditEntry) -> StoreResult<()> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO audit_logs (id, user_id, action, resource, metadata)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(entry.user_id)
        .bind(entry.action)
        .bind(entry.resource)
        .bind(entry.metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Writes an audit record, logging instead of failing when the write errors.
pub async fn log_audit(audit: &dyn AuditLog, entry: AuditEntry) {
    let action = entry.action.clone();
    if let Err(err) = audit.record(entry).await {
        tracing::warn!(error = %err, action = %action, "audit log failed");
    }
}
