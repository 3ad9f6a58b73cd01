//! PostgreSQL-backed idempotency store and claim fence.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::domains::idempotency::models::{
    IdempotencyClaim, IdempotencyRecord, IdempotencyScope, InsertOutcome, NewIdempotencyRecord,
    TerminalOutcome,
};
use crate::kernel::{BaseClaimFence, BaseIdempotencyStore, PgTx};

/// Adapter that implements [`BaseIdempotencyStore`] on the `idempotency_records` table.
///
/// Uses the pool directly, never the command's transaction: the record must
/// survive a rollback of the domain mutation.
#[derive(Clone)]
pub struct PgIdempotencyStore {
    db: PgPool,
}

impl PgIdempotencyStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl BaseIdempotencyStore for PgIdempotencyStore {
    async fn insert_if_absent(&self, record: &NewIdempotencyRecord) -> Result<InsertOutcome> {
        IdempotencyRecord::insert_if_absent(record, &self.db).await
    }

    async fn take_over_expired(
        &self,
        scope: &IdempotencyScope,
        observed_attempt: i32,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>> {
        IdempotencyRecord::take_over_expired(scope, observed_attempt, now, lease_expires_at, &self.db)
            .await
    }

    async fn finish(
        &self,
        claim: &IdempotencyClaim,
        outcome: &TerminalOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        IdempotencyRecord::finish(claim, outcome, now, &self.db).await
    }

    async fn find(&self, scope: &IdempotencyScope) -> Result<Option<IdempotencyRecord>> {
        IdempotencyRecord::find_by_scope(scope, &self.db).await
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        IdempotencyRecord::purge_terminal_before(cutoff, &self.db).await
    }

    async fn list_stuck(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<IdempotencyRecord>> {
        IdempotencyRecord::find_stuck(now, limit, &self.db).await
    }
}

/// Seals idempotency claims through the command's `sqlx` transaction.
#[derive(Debug, Clone, Default)]
pub struct PgClaimFence;

#[async_trait]
impl BaseClaimFence<PgTx> for PgClaimFence {
    async fn seal(
        &self,
        claim: &IdempotencyClaim,
        response_status: u16,
        response_body: &serde_json::Value,
        now: DateTime<Utc>,
        tx: &mut PgTx,
    ) -> Result<bool> {
        IdempotencyRecord::seal(claim, response_status, response_body, now, &mut **tx).await
    }
}
