//! Transactional outbox for same-transaction event persistence.
//!
//! A command writes its business data AND an outbox row in a single
//! transaction. The row exists if and only if the mutation committed, so there
//! is no window where the state changed but the event was lost (or the event
//! was recorded for a change that rolled back).
//!
//! Delivering rows to consumers is the job of a separate relay that polls
//! `outbox_events WHERE published_at IS NULL`; it is not part of this crate.
//!
//! # Schema Evolution
//!
//! Events are persisted as JSONB with versioned event types:
//! - `event_type()` includes version: `"directory.lead_created.v1"`
//! - New versions = new type with a new identifier
//! - No in-place migration: old rows stay as-is

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{Postgres, Transaction};
use std::fmt;
use uuid::Uuid;

use crate::common::{OutboxEventId, TenantId};
use crate::kernel::traits::BaseOutbox;

// =============================================================================
// CorrelationId
// =============================================================================

/// Correlation ID tying an outbox event (and audit row) back to the request
/// that produced it.
///
/// Use `CorrelationId::NONE` for uncorrelated work, or `CorrelationId::new()`
/// to generate a fresh ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Sentinel value for uncorrelated work (nil UUID).
    pub const NONE: Self = Self(Uuid::nil());

    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_none(&self) -> bool {
        self.0.is_nil()
    }

    pub fn into_inner(self) -> Uuid {
        self.0
    }

    /// Database representation: `NULL` for the NONE sentinel.
    pub fn as_option(&self) -> Option<Uuid> {
        if self.is_none() {
            None
        } else {
            Some(self.0)
        }
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<Option<Uuid>> for CorrelationId {
    fn from(opt: Option<Uuid>) -> Self {
        opt.map(Self).unwrap_or(Self::NONE)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

// =============================================================================
// OutboxEvent Trait
// =============================================================================

/// A domain event that can be persisted to the transactional outbox.
///
/// `event_type()` returns a versioned identifier, `"domain.event.vN"`.
///
/// ```ignore
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// pub struct LeadCreated {
///     pub lead_id: LeadId,
/// }
///
/// impl OutboxEvent for LeadCreated {
///     fn event_type() -> &'static str {
///         "directory.lead_created.v1"
///     }
/// }
/// ```
pub trait OutboxEvent: Serialize + DeserializeOwned + Send + Sync {
    fn event_type() -> &'static str;
}

/// An event produced by a mutation, not yet stamped with tenant/correlation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub event_type: &'static str,
    pub payload: serde_json::Value,
}

impl PendingEvent {
    pub fn from_event<E: OutboxEvent>(event: &E) -> Result<Self> {
        Ok(Self {
            event_type: E::event_type(),
            payload: serde_json::to_value(event)?,
        })
    }

    /// Attach the request metadata, producing the row to enqueue.
    pub fn stamp(self, tenant_id: Option<TenantId>, correlation_id: CorrelationId) -> NewOutboxEvent {
        NewOutboxEvent {
            id: OutboxEventId::new(),
            tenant_id,
            event_type: self.event_type.to_string(),
            payload: self.payload,
            correlation_id,
            created_at: Utc::now(),
        }
    }
}

/// Row to insert into `outbox_events`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub id: OutboxEventId,
    pub tenant_id: Option<TenantId>,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub correlation_id: CorrelationId,
    pub created_at: DateTime<Utc>,
}

/// A persisted outbox row, as a relay would read it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxEntry {
    pub id: OutboxEventId,
    pub tenant_id: Option<TenantId>,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub correlation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

// =============================================================================
// PostgreSQL outbox
// =============================================================================

/// Writes outbox rows through the caller's `sqlx` transaction.
#[derive(Debug, Clone, Default)]
pub struct PgOutbox;

#[async_trait]
impl BaseOutbox<Transaction<'static, Postgres>> for PgOutbox {
    async fn enqueue(
        &self,
        event: &NewOutboxEvent,
        tx: &mut Transaction<'static, Postgres>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events (id, tenant_id, event_type, payload, correlation_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(event.tenant_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.correlation_id.as_option())
        .bind(event.created_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

impl OutboxEntry {
    /// Unpublished rows for a tenant, oldest first.
    pub async fn find_pending_for_tenant(
        tenant_id: TenantId,
        pool: &sqlx::PgPool,
    ) -> Result<Vec<Self>> {
        let entries = sqlx::query_as::<_, OutboxEntry>(
            r#"
            SELECT id, tenant_id, event_type, payload, correlation_id, created_at, published_at
            FROM outbox_events
            WHERE tenant_id = $1 AND published_at IS NULL
            ORDER BY created_at ASC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(pool)
        .await?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Pinged {
        n: u32,
    }

    impl OutboxEvent for Pinged {
        fn event_type() -> &'static str {
            "test.pinged.v1"
        }
    }

    #[test]
    fn test_correlation_id_none() {
        let cid = CorrelationId::NONE;
        assert!(cid.is_none());
        assert_eq!(cid.as_option(), None);
        assert_eq!(format!("{}", cid), "NONE");
    }

    #[test]
    fn test_correlation_id_from_option() {
        let uuid = Uuid::new_v4();
        assert_eq!(CorrelationId::from(Some(uuid)).as_option(), Some(uuid));
        assert!(CorrelationId::from(None::<Uuid>).is_none());
    }

    #[test]
    fn test_pending_event_stamp_carries_metadata() {
        let tenant = TenantId::new();
        let cid = CorrelationId::new();

        let row = PendingEvent::from_event(&Pinged { n: 7 })
            .unwrap()
            .stamp(Some(tenant), cid);

        assert_eq!(row.event_type, "test.pinged.v1");
        assert_eq!(row.tenant_id, Some(tenant));
        assert_eq!(row.correlation_id, cid);
        assert_eq!(row.payload["n"], 7);
    }
}
