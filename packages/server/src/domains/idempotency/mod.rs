//! Idempotency domain - deduplication of client-retried commands.

pub mod coordinator;
pub mod models;
pub mod store;

pub use coordinator::{Decision, IdempotencyCoordinator, IdempotencyRequest};
pub use models::{
    IdempotencyClaim, IdempotencyRecord, IdempotencyScope, IdempotencyStatus, InsertOutcome,
    NewIdempotencyRecord, TerminalOutcome,
};
pub use store::{PgClaimFence, PgIdempotencyStore};
