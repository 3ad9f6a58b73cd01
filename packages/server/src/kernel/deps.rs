//! Server dependencies for commands (using traits for testability)
//!
//! `ServerDeps` is generic over the unit-of-work transaction handle so the same
//! command code runs against Postgres (`PgTx`) and the in-memory adapters used
//! in tests.

use sqlx::PgPool;
use std::sync::Arc;

use crate::config::IdempotencyConfig;
use crate::domains::directory::{DirectoryRepository, PgDirectoryRepository};
use crate::domains::idempotency::{IdempotencyCoordinator, PgClaimFence, PgIdempotencyStore};
use crate::kernel::audit::PgAuditLog;
use crate::kernel::outbox::PgOutbox;
use crate::kernel::unit_of_work::{PgTx, PgUnitOfWork};
use crate::kernel::{BaseAuditLog, BaseClaimFence, BaseIdempotencyStore, BaseOutbox, BaseUnitOfWork};

/// Dependencies accessible to command actions.
pub struct ServerDeps<Tx: Send + 'static> {
    pub idempotency: IdempotencyCoordinator,
    pub claim_fence: Arc<dyn BaseClaimFence<Tx>>,
    pub unit_of_work: Arc<dyn BaseUnitOfWork<Tx = Tx>>,
    pub outbox: Arc<dyn BaseOutbox<Tx>>,
    pub audit_log: Arc<dyn BaseAuditLog<Tx>>,
    pub directory: Arc<dyn DirectoryRepository<Tx>>,
}

// Manual impl: derive would require `Tx: Clone`
impl<Tx: Send + 'static> Clone for ServerDeps<Tx> {
    fn clone(&self) -> Self {
        Self {
            idempotency: self.idempotency.clone(),
            claim_fence: self.claim_fence.clone(),
            unit_of_work: self.unit_of_work.clone(),
            outbox: self.outbox.clone(),
            audit_log: self.audit_log.clone(),
            directory: self.directory.clone(),
        }
    }
}

impl<Tx: Send + 'static> ServerDeps<Tx> {
    pub fn new(
        idempotency_store: Arc<dyn BaseIdempotencyStore>,
        idempotency_config: IdempotencyConfig,
        claim_fence: Arc<dyn BaseClaimFence<Tx>>,
        unit_of_work: Arc<dyn BaseUnitOfWork<Tx = Tx>>,
        outbox: Arc<dyn BaseOutbox<Tx>>,
        audit_log: Arc<dyn BaseAuditLog<Tx>>,
        directory: Arc<dyn DirectoryRepository<Tx>>,
    ) -> Self {
        Self {
            idempotency: IdempotencyCoordinator::new(idempotency_store, idempotency_config),
            claim_fence,
            unit_of_work,
            outbox,
            audit_log,
            directory,
        }
    }
}

impl ServerDeps<PgTx> {
    /// Production wiring: every adapter backed by the same pool.
    pub fn postgres(pool: PgPool, config: IdempotencyConfig) -> Self {
        Self::new(
            Arc::new(PgIdempotencyStore::new(pool.clone())),
            config,
            Arc::new(PgClaimFence),
            Arc::new(PgUnitOfWork::new(pool)),
            Arc::new(PgOutbox),
            Arc::new(PgAuditLog),
            Arc::new(PgDirectoryRepository),
        )
    }
}
