// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only - no business logic.
// The command protocol (kernel::executor) and the idempotency decision logic
// (domains::idempotency) are written against these ports so that Postgres and
// in-memory adapters are interchangeable.
//
// Naming convention: Base* for trait names (e.g., BaseOutbox, BaseUnitOfWork)

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domains::idempotency::models::{
    IdempotencyClaim, IdempotencyRecord, IdempotencyScope, InsertOutcome, NewIdempotencyRecord,
    TerminalOutcome,
};
use crate::kernel::audit::NewAuditEntry;
use crate::kernel::outbox::NewOutboxEvent;

// =============================================================================
// Idempotency Store (Infrastructure - durable dedup records)
// =============================================================================

/// Durable map from `(tenant, action, idempotency-key)` to an idempotency record.
///
/// Records are written outside the domain transaction: the `IN_PROGRESS` insert
/// happens before it opens and the terminal write after it has committed or
/// rolled back.
#[async_trait]
pub trait BaseIdempotencyStore: Send + Sync {
    /// Atomically create an `IN_PROGRESS` record, or return the existing one.
    ///
    /// Must be a single compare-and-set (unique-constraint insert, locked map
    /// entry, ...): two concurrent callers can never both get `Inserted`.
    async fn insert_if_absent(&self, record: &NewIdempotencyRecord) -> Result<InsertOutcome>;

    /// Take over an `IN_PROGRESS` record whose lease expired at `observed_attempt`.
    ///
    /// Increments the attempt and renews the lease. Returns `None` if the record
    /// is no longer in that state.
    async fn take_over_expired(
        &self,
        scope: &IdempotencyScope,
        observed_attempt: i32,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>>;

    /// Transition the claimed attempt to its terminal state.
    ///
    /// Returns `false` (and writes nothing) if the record is not `IN_PROGRESS`
    /// at the claimed attempt.
    async fn finish(
        &self,
        claim: &IdempotencyClaim,
        outcome: &TerminalOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn find(&self, scope: &IdempotencyScope) -> Result<Option<IdempotencyRecord>>;

    /// Delete terminal records completed before `cutoff`. Returns rows removed.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// `IN_PROGRESS` records whose lease expired before `now`.
    async fn list_stuck(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<IdempotencyRecord>>;
}

// =============================================================================
// Claim Fence (Infrastructure - idempotency claim inside the domain transaction)
// =============================================================================

/// Ties the idempotency claim to the domain transaction.
///
/// The executor seals its claim as the last write of the transaction. Sealing
/// fails if the attempt was superseded, and a sealed record can no longer be
/// taken over, so at most one attempt per key ever commits a mutation.
#[async_trait]
pub trait BaseClaimFence<Tx: Send>: Send + Sync {
    /// Mark the claimed attempt committed, storing the response it will complete
    /// with. Returns `false` (and writes nothing) if the record is not
    /// `IN_PROGRESS` at the claimed attempt.
    async fn seal(
        &self,
        claim: &IdempotencyClaim,
        response_status: u16,
        response_body: &serde_json::Value,
        now: DateTime<Utc>,
        tx: &mut Tx,
    ) -> Result<bool>;
}

// =============================================================================
// Unit of Work (Infrastructure - transaction boundary)
// =============================================================================

/// Transaction boundary. Prefer [`within_transaction`](crate::kernel::within_transaction)
/// over calling these directly.
#[async_trait]
pub trait BaseUnitOfWork: Send + Sync {
    /// Transaction handle passed to every repository call that must be atomic
    /// with the others.
    type Tx: Send + 'static;

    async fn begin(&self) -> Result<Self::Tx>;

    async fn commit(&self, tx: Self::Tx) -> Result<()>;

    async fn rollback(&self, tx: Self::Tx) -> Result<()>;
}

// =============================================================================
// Outbox (Infrastructure - same-transaction event persistence)
// =============================================================================

#[async_trait]
pub trait BaseOutbox<Tx: Send>: Send + Sync {
    /// Record that `event` must eventually be delivered. Uses the caller's
    /// transaction, so the row exists if and only if the mutation committed.
    async fn enqueue(&self, event: &NewOutboxEvent, tx: &mut Tx) -> Result<()>;
}

// =============================================================================
// Audit Log (Infrastructure - side-channel recording)
// =============================================================================

#[async_trait]
pub trait BaseAuditLog<Tx: Send>: Send + Sync {
    async fn record(&self, entry: &NewAuditEntry, tx: &mut Tx) -> Result<()>;
}
