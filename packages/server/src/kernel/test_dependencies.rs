// TestDependencies - in-memory implementations for testing
//
// Provides adapters for every port the command executor touches, so the whole
// protocol (idempotency, transaction, outbox, audit, domain writes) runs without
// a database. Each adapter records enough to assert on and can be told to fail.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::{
    BaseAuditLog, BaseClaimFence, BaseIdempotencyStore, BaseOutbox, BaseUnitOfWork, ServerDeps,
};
use crate::common::{RestaurantId, TenantId};
use crate::config::IdempotencyConfig;
use crate::domains::directory::models::{Lead, NewLead, NewRestaurant, Restaurant};
use crate::domains::directory::DirectoryRepository;
use crate::domains::idempotency::models::{
    IdempotencyClaim, IdempotencyRecord, IdempotencyScope, IdempotencyStatus, InsertOutcome,
    NewIdempotencyRecord, TerminalOutcome,
};
use crate::kernel::audit::NewAuditEntry;
use crate::kernel::outbox::NewOutboxEvent;

// =============================================================================
// In-memory Idempotency Store
// =============================================================================

/// Idempotency store backed by a locked map. `insert_if_absent` is a single
/// critical section, so it has the same create-if-absent guarantee as the
/// Postgres unique constraint.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    records: Mutex<HashMap<IdempotencyScope, IdempotencyRecord>>,
    fail_finish: AtomicBool,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `finish` (complete/fail) return an error.
    pub fn fail_finish(&self, fail: bool) {
        self.fail_finish.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    pub fn get(&self, scope: &IdempotencyScope) -> Option<IdempotencyRecord> {
        self.records().get(scope).cloned()
    }

    /// Push a record's lease into the past, as if its executor had crashed.
    pub fn expire_lease(&self, scope: &IdempotencyScope) {
        if let Some(record) = self.records().get_mut(scope) {
            record.lease_expires_at = Utc::now() - chrono::Duration::seconds(1);
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<IdempotencyScope, IdempotencyRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BaseIdempotencyStore for InMemoryIdempotencyStore {
    async fn insert_if_absent(&self, record: &NewIdempotencyRecord) -> Result<InsertOutcome> {
        let mut records = self.records();

        if let Some(existing) = records.get(&record.scope) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }

        let inserted = record.clone().into_record();
        records.insert(record.scope.clone(), inserted.clone());
        Ok(InsertOutcome::Inserted(inserted))
    }

    async fn take_over_expired(
        &self,
        scope: &IdempotencyScope,
        observed_attempt: i32,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>> {
        let mut records = self.records();

        match records.get_mut(scope) {
            Some(record)
                if record.status == IdempotencyStatus::InProgress
                    && record.attempt == observed_attempt
                    && record.lease_expires_at <= now
                    && record.committed_at.is_none() =>
            {
                record.attempt += 1;
                record.lease_expires_at = lease_expires_at;
                record.updated_at = now;
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn finish(
        &self,
        claim: &IdempotencyClaim,
        outcome: &TerminalOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if self.fail_finish.load(Ordering::SeqCst) {
            return Err(anyhow!("idempotency store unavailable"));
        }

        let mut records = self.records();

        match records.get_mut(&claim.scope) {
            Some(record)
                if record.status == IdempotencyStatus::InProgress
                    && record.attempt == claim.attempt =>
            {
                record.status = outcome.status;
                record.response_status = Some(i32::from(outcome.response_status));
                record.response_body = Some(outcome.response_body.clone());
                record.completed_at = Some(now);
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find(&self, scope: &IdempotencyScope) -> Result<Option<IdempotencyRecord>> {
        Ok(self.get(scope))
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records();
        let before = records.len();

        records.retain(|_, record| {
            !(record.status.is_terminal()
                && record.completed_at.map(|at| at < cutoff).unwrap_or(false))
        });

        Ok((before - records.len()) as u64)
    }

    async fn list_stuck(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<IdempotencyRecord>> {
        let mut stuck: Vec<IdempotencyRecord> = self
            .records()
            .values()
            .filter(|r| r.status == IdempotencyStatus::InProgress && r.lease_expires_at <= now)
            .cloned()
            .collect();

        stuck.sort_by_key(|r| r.created_at);
        stuck.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(stuck)
    }
}

/// Seals straight into the record map. Transactions are serialized and the
/// in-memory commit cannot fail, so nothing can observe a seal that is later
/// rolled back.
#[async_trait]
impl BaseClaimFence<MemoryTx> for InMemoryIdempotencyStore {
    async fn seal(
        &self,
        claim: &IdempotencyClaim,
        response_status: u16,
        response_body: &serde_json::Value,
        now: DateTime<Utc>,
        _tx: &mut MemoryTx,
    ) -> Result<bool> {
        let mut records = self.records();

        match records.get_mut(&claim.scope) {
            Some(record)
                if record.status == IdempotencyStatus::InProgress
                    && record.attempt == claim.attempt
                    && record.committed_at.is_none() =>
            {
                record.committed_at = Some(now);
                record.response_status = Some(i32::from(response_status));
                record.response_body = Some(response_body.clone());
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// =============================================================================
// In-memory Unit of Work
// =============================================================================

/// Everything the in-memory adapters write transactionally.
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub restaurants: Vec<Restaurant>,
    pub leads: Vec<Lead>,
    pub outbox_events: Vec<NewOutboxEvent>,
    pub audit_entries: Vec<NewAuditEntry>,
}

/// Transaction handle: holds the state lock and a working copy of the state.
///
/// Commit writes the copy back; rollback (or drop) discards it. Transactions are
/// serialized by the lock.
pub struct MemoryTx {
    committed: OwnedMutexGuard<MemoryState>,
    pub state: MemoryState,
}

#[derive(Default)]
pub struct MemoryUnitOfWork {
    state: Arc<AsyncMutex<MemoryState>>,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl MemoryUnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed state.
    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BaseUnitOfWork for MemoryUnitOfWork {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx> {
        let committed = self.state.clone().lock_owned().await;
        let state = committed.clone();
        Ok(MemoryTx { committed, state })
    }

    async fn commit(&self, tx: MemoryTx) -> Result<()> {
        let MemoryTx {
            mut committed,
            state,
        } = tx;
        *committed = state;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, tx: MemoryTx) -> Result<()> {
        drop(tx);
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// In-memory Outbox
// =============================================================================

#[derive(Default)]
pub struct MemoryOutbox {
    fail_on_enqueue: AtomicBool,
    enqueue_calls: AtomicUsize,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every enqueue fail, rolling back the surrounding transaction.
    pub fn failing() -> Self {
        let outbox = Self::default();
        outbox.fail_on_enqueue.store(true, Ordering::SeqCst);
        outbox
    }

    pub fn enqueue_calls(&self) -> usize {
        self.enqueue_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BaseOutbox<MemoryTx> for MemoryOutbox {
    async fn enqueue(&self, event: &NewOutboxEvent, tx: &mut MemoryTx) -> Result<()> {
        self.enqueue_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_on_enqueue.load(Ordering::SeqCst) {
            return Err(anyhow!("outbox unavailable"));
        }

        tx.state.outbox_events.push(event.clone());
        Ok(())
    }
}

// =============================================================================
// In-memory Audit Log
// =============================================================================

#[derive(Default)]
pub struct MemoryAuditLog;

#[async_trait]
impl BaseAuditLog<MemoryTx> for MemoryAuditLog {
    async fn record(&self, entry: &NewAuditEntry, tx: &mut MemoryTx) -> Result<()> {
        tx.state.audit_entries.push(entry.clone());
        Ok(())
    }
}

// =============================================================================
// In-memory Directory Repository
// =============================================================================

/// Directory repository over `MemoryTx`, with spies on the domain checks.
#[derive(Default)]
pub struct MemoryDirectoryRepository {
    slug_checks: AtomicUsize,
    restaurant_lookups: AtomicUsize,
    latency: Option<Duration>,
}

impl MemoryDirectoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before every insert, keeping the transaction open so that a
    /// concurrent request observes the record `IN_PROGRESS`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of slug-uniqueness checks performed.
    pub fn slug_checks(&self) -> usize {
        self.slug_checks.load(Ordering::SeqCst)
    }

    pub fn restaurant_lookups(&self) -> usize {
        self.restaurant_lookups.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl DirectoryRepository<MemoryTx> for MemoryDirectoryRepository {
    async fn find_restaurant(
        &self,
        tenant_id: TenantId,
        id: RestaurantId,
        tx: &mut MemoryTx,
    ) -> Result<Option<Restaurant>> {
        self.restaurant_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(tx
            .state
            .restaurants
            .iter()
            .find(|r| r.tenant_id == tenant_id && r.id == id)
            .cloned())
    }

    async fn find_restaurant_by_slug(
        &self,
        tenant_id: TenantId,
        slug: &str,
        tx: &mut MemoryTx,
    ) -> Result<Option<Restaurant>> {
        self.slug_checks.fetch_add(1, Ordering::SeqCst);
        Ok(tx
            .state
            .restaurants
            .iter()
            .find(|r| r.tenant_id == tenant_id && r.slug == slug)
            .cloned())
    }

    async fn insert_restaurant(&self, new: NewRestaurant, tx: &mut MemoryTx) -> Result<Restaurant> {
        self.simulate_latency().await;

        let restaurant = new.into_restaurant();
        tx.state.restaurants.push(restaurant.clone());
        Ok(restaurant)
    }

    async fn insert_lead(&self, new: NewLead, tx: &mut MemoryTx) -> Result<Lead> {
        self.simulate_latency().await;

        let lead = new.into_lead();
        tx.state.leads.push(lead.clone());
        Ok(lead)
    }
}

// =============================================================================
// TestDependencies
// =============================================================================

/// Container for in-memory test dependencies.
///
/// ```ignore
/// let test_deps = TestDependencies::new();
/// let deps = test_deps.deps();
/// create_restaurant(&deps, &ctx, cmd).await?;
/// assert_eq!(test_deps.restaurants().await.len(), 1);
/// ```
pub struct TestDependencies {
    pub idempotency_store: Arc<InMemoryIdempotencyStore>,
    pub unit_of_work: Arc<MemoryUnitOfWork>,
    pub outbox: Arc<MemoryOutbox>,
    pub audit_log: Arc<MemoryAuditLog>,
    pub directory: Arc<MemoryDirectoryRepository>,
    pub config: IdempotencyConfig,
}

impl Default for TestDependencies {
    fn default() -> Self {
        Self::new()
    }
}

impl TestDependencies {
    pub fn new() -> Self {
        Self {
            idempotency_store: Arc::new(InMemoryIdempotencyStore::new()),
            unit_of_work: Arc::new(MemoryUnitOfWork::new()),
            outbox: Arc::new(MemoryOutbox::new()),
            audit_log: Arc::new(MemoryAuditLog),
            directory: Arc::new(MemoryDirectoryRepository::new()),
            config: IdempotencyConfig::default(),
        }
    }

    pub fn with_config(mut self, config: IdempotencyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_outbox(mut self, outbox: MemoryOutbox) -> Self {
        self.outbox = Arc::new(outbox);
        self
    }

    pub fn with_directory(mut self, directory: MemoryDirectoryRepository) -> Self {
        self.directory = Arc::new(directory);
        self
    }

    /// Build `ServerDeps` wired to these adapters. Every call shares the same state.
    pub fn deps(&self) -> ServerDeps<MemoryTx> {
        ServerDeps::new(
            self.idempotency_store.clone(),
            self.config.clone(),
            self.idempotency_store.clone(),
            self.unit_of_work.clone(),
            self.outbox.clone(),
            self.audit_log.clone(),
            self.directory.clone(),
        )
    }

    pub async fn restaurants(&self) -> Vec<Restaurant> {
        self.unit_of_work.snapshot().await.restaurants
    }

    pub async fn leads(&self) -> Vec<Lead> {
        self.unit_of_work.snapshot().await.leads
    }

    pub async fn outbox_events(&self) -> Vec<NewOutboxEvent> {
        self.unit_of_work.snapshot().await.outbox_events
    }

    pub async fn audit_entries(&self) -> Vec<NewAuditEntry> {
        self.unit_of_work.snapshot().await.audit_entries
    }

    /// Seed a committed restaurant, bypassing the command protocol.
    pub async fn seed_restaurant(&self, tenant_id: TenantId, name: &str, slug: &str) -> Restaurant {
        let restaurant = NewRestaurant {
            tenant_id,
            name: name.to_string(),
            slug: slug.to_string(),
            cuisine: None,
            created_by: None,
        }
        .into_restaurant();

        let mut state = self.unit_of_work.state.lock().await;
        state.restaurants.push(restaurant.clone());
        restaurant
    }
}
