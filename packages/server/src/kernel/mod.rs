//! Kernel module - command infrastructure and dependencies.

pub mod audit;
pub mod deps;
pub mod error;
pub mod executor;
pub mod outbox;
pub mod test_dependencies;
pub mod traits;
pub mod unit_of_work;

pub use audit::{AuditEntry, NewAuditEntry, PgAuditLog};
pub use deps::ServerDeps;
pub use error::{CommandError, ValidationError};
pub use executor::{
    execute_command, CommandContext, CommandResponse, IdempotentCommand, Mutation, MutationInput,
    TenantScope,
};
pub use outbox::{CorrelationId, NewOutboxEvent, OutboxEntry, OutboxEvent, PendingEvent, PgOutbox};
pub use test_dependencies::TestDependencies;
pub use traits::*;
pub use unit_of_work::{within_transaction, PgTx, PgUnitOfWork};
