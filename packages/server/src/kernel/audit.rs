//! Audit log written alongside every successful command.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::common::{AuditEntryId, TenantId, UserId};
use crate::kernel::outbox::CorrelationId;
use crate::kernel::traits::BaseAuditLog;

/// Values for a new `audit_log` row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    pub id: AuditEntryId,
    pub tenant_id: Option<TenantId>,
    pub actor_id: Option<UserId>,
    pub action_key: String,
    pub idempotency_key: String,
    pub correlation_id: CorrelationId,
    /// The response body returned to the caller.
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: AuditEntryId,
    pub tenant_id: Option<TenantId>,
    pub actor_id: Option<UserId>,
    pub action_key: String,
    pub idempotency_key: String,
    pub correlation_id: Option<Uuid>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub async fn find_by_action(
        tenant_id: TenantId,
        action_key: &str,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        let entries = sqlx::query_as::<_, AuditEntry>(
            "SELECT * FROM audit_log WHERE tenant_id = $1 AND action_key = $2 ORDER BY created_at",
        )
        .bind(tenant_id)
        .bind(action_key)
        .fetch_all(pool)
        .await?;
        Ok(entries)
    }
}

/// Writes audit rows through the caller's `sqlx` transaction.
#[derive(Debug, Clone, Default)]
pub struct PgAuditLog;

#[async_trait]
impl BaseAuditLog<Transaction<'static, Postgres>> for PgAuditLog {
    async fn record(
        &self,
        entry: &NewAuditEntry,
        tx: &mut Transaction<'static, Postgres>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (
                id, tenant_id, actor_id, action_key, idempotency_key,
                correlation_id, details, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.tenant_id)
        .bind(entry.actor_id)
        .bind(&entry.action_key)
        .bind(&entry.idempotency_key)
        .bind(entry.correlation_id.as_option())
        .bind(&entry.details)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
