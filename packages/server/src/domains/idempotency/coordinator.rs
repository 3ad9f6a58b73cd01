//! Decides, per incoming command, whether to proceed, replay, reject, or ask the
//! caller to retry later.
//!
//! # Decisions
//!
//! | Stored record                          | Decision      |
//! |----------------------------------------|---------------|
//! | none (this caller inserted it)         | `Started`     |
//! | hash differs from the request's hash   | `Mismatch`    |
//! | `COMPLETED`                            | `Replay`      |
//! | `FAILED`                               | `Failed`      |
//! | `IN_PROGRESS`, lease still valid       | `InProgress`  |
//! | `IN_PROGRESS`, lease expired           | `Started` (take-over) or `InProgress` (lost the race) |
//! | `IN_PROGRESS`, sealed, lease expired   | `Replay` (completed on the executor's behalf) |
//!
//! A sealed record is one whose mutation committed but whose `complete` never
//! landed. It is finished with the response stored by the seal, never re-executed.
//!
//! The hash check only applies when both the stored and the incoming hash are
//! present; callers that omit a hash are never told `Mismatch`.
//!
//! The coordinator never blocks: `InProgress` carries a `retry_after_ms` hint and
//! the caller decides how to back off. No lock is held between attempts; the only
//! shared state is the record itself.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::common::UserId;
use crate::config::IdempotencyConfig;
use crate::domains::idempotency::models::{
    IdempotencyClaim, IdempotencyRecord, IdempotencyScope, IdempotencyStatus, InsertOutcome,
    NewIdempotencyRecord, TerminalOutcome,
};
use crate::kernel::BaseIdempotencyStore;

/// Outcome of [`IdempotencyCoordinator::start_or_replay`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// This caller owns the attempt and must execute the mutation.
    Started(IdempotencyClaim),
    /// A completed response exists; return it without executing.
    Replay {
        response_status: u16,
        response_body: serde_json::Value,
    },
    /// A failed response exists; surface it. A new idempotency key is needed to retry.
    Failed {
        response_status: u16,
        response_body: serde_json::Value,
    },
    /// Another request with the same key is executing.
    InProgress { retry_after_ms: u64 },
    /// The key was used before with a different payload.
    Mismatch,
}

/// Incoming request as seen by the coordinator.
#[derive(Debug, Clone)]
pub struct IdempotencyRequest {
    pub scope: IdempotencyScope,
    /// Hash of the normalized payload; `None` disables mismatch detection.
    pub request_hash: Option<String>,
    pub user_id: Option<UserId>,
}

#[derive(Clone)]
pub struct IdempotencyCoordinator {
    store: Arc<dyn BaseIdempotencyStore>,
    config: IdempotencyConfig,
}

impl IdempotencyCoordinator {
    pub fn new(store: Arc<dyn BaseIdempotencyStore>, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    pub async fn start_or_replay(&self, request: &IdempotencyRequest) -> Result<Decision> {
        let now = Utc::now();
        let new_record = NewIdempotencyRecord {
            scope: request.scope.clone(),
            request_hash: request.request_hash.clone(),
            user_id: request.user_id,
            lease_expires_at: self.lease_from(now)?,
            now,
        };

        let existing = match self.store.insert_if_absent(&new_record).await? {
            InsertOutcome::Inserted(record) => {
                info!(
                    action_key = %request.scope.action_key,
                    tenant_id = ?request.scope.tenant_id,
                    idempotency_key = %request.scope.idempotency_key,
                    "Idempotency key claimed"
                );
                return Ok(Decision::Started(IdempotencyClaim {
                    scope: request.scope.clone(),
                    attempt: record.attempt,
                }));
            }
            InsertOutcome::Existing(record) => record,
        };

        if hashes_conflict(existing.request_hash.as_deref(), request.request_hash.as_deref()) {
            warn!(
                action_key = %request.scope.action_key,
                tenant_id = ?request.scope.tenant_id,
                idempotency_key = %request.scope.idempotency_key,
                "Idempotency key reused with a different payload"
            );
            return Ok(Decision::Mismatch);
        }

        if existing.lease_expired(now) {
            if existing.is_sealed() {
                return self.complete_sealed(existing, now).await;
            }
            return self.take_over(existing, now).await;
        }

        Ok(self.settled_decision(&existing, now))
    }

    /// Record a successful outcome for the claimed attempt.
    ///
    /// Returns `false` if the attempt was superseded (its lease expired and
    /// another request took over); nothing is written in that case.
    pub async fn complete(
        &self,
        claim: &IdempotencyClaim,
        response_status: u16,
        response_body: serde_json::Value,
    ) -> Result<bool> {
        self.finish(
            claim,
            TerminalOutcome {
                status: IdempotencyStatus::Completed,
                response_status,
                response_body,
            },
        )
        .await
    }

    /// Record a failed outcome for the claimed attempt. Same contract as `complete`.
    pub async fn fail(
        &self,
        claim: &IdempotencyClaim,
        response_status: u16,
        response_body: serde_json::Value,
    ) -> Result<bool> {
        self.finish(
            claim,
            TerminalOutcome {
                status: IdempotencyStatus::Failed,
                response_status,
                response_body,
            },
        )
        .await
    }

    /// Delete terminal records older than the configured retention.
    pub async fn purge_expired(&self) -> Result<u64> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .context("idempotency retention out of range")?;
        let cutoff = Utc::now() - retention;

        let purged = self.store.purge_terminal_before(cutoff).await?;
        info!(purged, %cutoff, "Purged expired idempotency records");
        Ok(purged)
    }

    /// `IN_PROGRESS` records whose executor stopped renewing them.
    pub async fn list_stuck(&self, limit: i64) -> Result<Vec<IdempotencyRecord>> {
        self.store.list_stuck(Utc::now(), limit).await
    }

    async fn take_over(&self, stale: IdempotencyRecord, now: DateTime<Utc>) -> Result<Decision> {
        let scope = stale.scope();
        let lease_expires_at = self.lease_from(now)?;

        if let Some(record) = self
            .store
            .take_over_expired(&scope, stale.attempt, now, lease_expires_at)
            .await?
        {
            warn!(
                action_key = %scope.action_key,
                tenant_id = ?scope.tenant_id,
                idempotency_key = %scope.idempotency_key,
                previous_attempt = stale.attempt,
                attempt = record.attempt,
                "Took over idempotency record with expired lease"
            );
            return Ok(Decision::Started(IdempotencyClaim {
                scope,
                attempt: record.attempt,
            }));
        }

        // Someone else finished or took over first
        debug!(
            action_key = %scope.action_key,
            idempotency_key = %scope.idempotency_key,
            "Lost idempotency take-over race"
        );
        match self.store.find(&scope).await? {
            Some(current) if current.lease_expired(now) && current.is_sealed() => {
                self.complete_sealed(current, now).await
            }
            Some(current) => Ok(self.settled_decision(&current, now)),
            None => Ok(Decision::InProgress {
                retry_after_ms: self.retry_after_hint(None, now),
            }),
        }
    }

    /// Write the terminal state an executor committed but never recorded.
    async fn complete_sealed(&self, sealed: IdempotencyRecord, now: DateTime<Utc>) -> Result<Decision> {
        let claim = IdempotencyClaim {
            scope: sealed.scope(),
            attempt: sealed.attempt,
        };
        let outcome = TerminalOutcome {
            status: IdempotencyStatus::Completed,
            response_status: sealed.stored_status(),
            response_body: sealed.stored_body(),
        };

        if self.store.finish(&claim, &outcome, now).await? {
            warn!(
                action_key = %claim.scope.action_key,
                tenant_id = ?claim.scope.tenant_id,
                idempotency_key = %claim.scope.idempotency_key,
                attempt = claim.attempt,
                "Completed sealed idempotency record left by a stalled executor"
            );
            return Ok(Decision::Replay {
                response_status: outcome.response_status,
                response_body: outcome.response_body,
            });
        }

        // The executor's own complete() got there first
        match self.store.find(&claim.scope).await? {
            Some(current) => Ok(self.settled_decision(&current, now)),
            None => Ok(Decision::InProgress {
                retry_after_ms: self.retry_after_hint(None, now),
            }),
        }
    }

    fn settled_decision(&self, record: &IdempotencyRecord, now: DateTime<Utc>) -> Decision {
        match record.status {
            IdempotencyStatus::Completed => Decision::Replay {
                response_status: record.stored_status(),
                response_body: record.stored_body(),
            },
            IdempotencyStatus::Failed => Decision::Failed {
                response_status: record.stored_status(),
                response_body: record.stored_body(),
            },
            IdempotencyStatus::InProgress => Decision::InProgress {
                retry_after_ms: self.retry_after_hint(Some(record.lease_expires_at), now),
            },
        }
    }

    async fn finish(&self, claim: &IdempotencyClaim, outcome: TerminalOutcome) -> Result<bool> {
        let applied = self.store.finish(claim, &outcome, Utc::now()).await?;

        if applied {
            info!(
                action_key = %claim.scope.action_key,
                tenant_id = ?claim.scope.tenant_id,
                idempotency_key = %claim.scope.idempotency_key,
                status = %outcome.status,
                response_status = outcome.response_status,
                "Idempotency record finalized"
            );
        } else {
            warn!(
                action_key = %claim.scope.action_key,
                tenant_id = ?claim.scope.tenant_id,
                idempotency_key = %claim.scope.idempotency_key,
                attempt = claim.attempt,
                status = %outcome.status,
                "Idempotency attempt was superseded; outcome not recorded"
            );
        }

        Ok(applied)
    }

    fn lease_from(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let lease =
            chrono::Duration::from_std(self.config.lease).context("idempotency lease out of range")?;
        Ok(now + lease)
    }

    /// Configured hint, clamped to the time left on the lease (at least 1ms).
    fn retry_after_hint(&self, lease_expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> u64 {
        let configured = u64::try_from(self.config.retry_after.as_millis()).unwrap_or(u64::MAX);

        let remaining = lease_expires_at
            .map(|expires| (expires - now).num_milliseconds())
            .map(|ms| u64::try_from(ms).unwrap_or(0));

        match remaining {
            Some(remaining) => configured.min(remaining).max(1),
            None => configured.max(1),
        }
    }
}

/// Only two present, different hashes conflict.
fn hashes_conflict(stored: Option<&str>, incoming: Option<&str>) -> bool {
    matches!((stored, incoming), (Some(a), Some(b)) if a != b)
}
