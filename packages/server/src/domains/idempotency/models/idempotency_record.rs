use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};

use crate::common::{IdempotencyRecordId, TenantId, UserId};

/// Lifecycle of an idempotency record.
///
/// `InProgress` transitions exactly once to `Completed` or `Failed`; terminal
/// records are never modified again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "idempotency_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    InProgress,
    Completed,
    Failed,
}

impl IdempotencyStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, IdempotencyStatus::InProgress)
    }
}

impl std::fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdempotencyStatus::InProgress => write!(f, "IN_PROGRESS"),
            IdempotencyStatus::Completed => write!(f, "COMPLETED"),
            IdempotencyStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// The deduplication key: `(tenant, action, idempotency-key)`.
///
/// `tenant_id` is `None` only for platform-wide actions; `None` is a value of its
/// own for uniqueness purposes (two platform-wide requests with the same key collide).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyScope {
    pub tenant_id: Option<TenantId>,
    pub action_key: String,
    pub idempotency_key: String,
}

impl IdempotencyScope {
    pub fn new(
        tenant_id: Option<TenantId>,
        action_key: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            action_key: action_key.into(),
            idempotency_key: idempotency_key.into(),
        }
    }
}

/// Proof that the caller owns the current attempt of an `IN_PROGRESS` record.
///
/// Returned with `Decision::Started`; terminal writes only apply while the stored
/// attempt still matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyClaim {
    pub scope: IdempotencyScope,
    pub attempt: i32,
}

/// Terminal outcome written by `complete` / `fail`.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalOutcome {
    pub status: IdempotencyStatus,
    pub response_status: u16,
    pub response_body: serde_json::Value,
}

/// Row of `idempotency_records`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IdempotencyRecord {
    pub id: IdempotencyRecordId,
    pub tenant_id: Option<TenantId>,
    pub action_key: String,
    pub idempotency_key: String,
    pub request_hash: Option<String>,
    pub user_id: Option<UserId>,
    pub status: IdempotencyStatus,
    pub attempt: i32,
    pub lease_expires_at: DateTime<Utc>,
    pub response_status: Option<i32>,
    pub response_body: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// When the claimed attempt's transaction sealed the record. Set while still
    /// `IN_PROGRESS`; a sealed record is never taken over.
    pub committed_at: Option<DateTime<Utc>>,
}

/// Values for a fresh `IN_PROGRESS` record.
#[derive(Debug, Clone)]
pub struct NewIdempotencyRecord {
    pub scope: IdempotencyScope,
    pub request_hash: Option<String>,
    pub user_id: Option<UserId>,
    pub lease_expires_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

impl NewIdempotencyRecord {
    /// Materialize the row as it will be stored (attempt 1, no response yet).
    pub fn into_record(self) -> IdempotencyRecord {
        IdempotencyRecord {
            id: IdempotencyRecordId::new(),
            tenant_id: self.scope.tenant_id,
            action_key: self.scope.action_key,
            idempotency_key: self.scope.idempotency_key,
            request_hash: self.request_hash,
            user_id: self.user_id,
            status: IdempotencyStatus::InProgress,
            attempt: 1,
            lease_expires_at: self.lease_expires_at,
            response_status: None,
            response_body: None,
            created_at: self.now,
            updated_at: self.now,
            completed_at: None,
            committed_at: None,
        }
    }
}

/// Result of the atomic create-if-absent.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// This caller created the record.
    Inserted(IdempotencyRecord),
    /// A record already existed for the scope; it is returned untouched.
    Existing(IdempotencyRecord),
}

impl IdempotencyRecord {
    pub fn scope(&self) -> IdempotencyScope {
        IdempotencyScope {
            tenant_id: self.tenant_id,
            action_key: self.action_key.clone(),
            idempotency_key: self.idempotency_key.clone(),
        }
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == IdempotencyStatus::InProgress && self.lease_expires_at <= now
    }

    /// `IN_PROGRESS`, but the mutation already committed; only the terminal
    /// write is missing.
    pub fn is_sealed(&self) -> bool {
        self.status == IdempotencyStatus::InProgress && self.committed_at.is_some()
    }

    /// Stored response status, defaulting to 200 for rows written without one.
    pub fn stored_status(&self) -> u16 {
        self.response_status
            .and_then(|s| u16::try_from(s).ok())
            .unwrap_or(200)
    }

    pub fn stored_body(&self) -> serde_json::Value {
        self.response_body
            .clone()
            .unwrap_or(serde_json::Value::Null)
    }
}

// =============================================================================
// SQL Queries - ALL queries must be in models/
// =============================================================================

impl IdempotencyRecord {
    /// Insert an `IN_PROGRESS` record unless one already exists for the scope.
    ///
    /// Relies on the `idempotency_records_scope_key` unique constraint
    /// (`NULLS NOT DISTINCT`), so two concurrent inserts can never both succeed.
    pub async fn insert_if_absent(new: &NewIdempotencyRecord, pool: &PgPool) -> Result<InsertOutcome> {
        let inserted = sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            INSERT INTO idempotency_records (
                id, tenant_id, action_key, idempotency_key, request_hash, user_id,
                status, attempt, lease_expires_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'in_progress', 1, $7, $8, $8)
            ON CONFLICT ON CONSTRAINT idempotency_records_scope_key DO NOTHING
            RETURNING *
            "#,
        )
        .bind(IdempotencyRecordId::new())
        .bind(new.scope.tenant_id)
        .bind(&new.scope.action_key)
        .bind(&new.scope.idempotency_key)
        .bind(&new.request_hash)
        .bind(new.user_id)
        .bind(new.lease_expires_at)
        .bind(new.now)
        .fetch_optional(pool)
        .await?;

        if let Some(record) = inserted {
            return Ok(InsertOutcome::Inserted(record));
        }

        match Self::find_by_scope(&new.scope, pool).await? {
            Some(existing) => Ok(InsertOutcome::Existing(existing)),
            // The conflicting row was purged between the insert and the read
            None => anyhow::bail!(
                "idempotency record for {}/{} vanished during insert",
                new.scope.action_key,
                new.scope.idempotency_key
            ),
        }
    }

    pub async fn find_by_scope(scope: &IdempotencyScope, pool: &PgPool) -> Result<Option<Self>> {
        let record = sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            SELECT * FROM idempotency_records
            WHERE tenant_id IS NOT DISTINCT FROM $1
              AND action_key = $2
              AND idempotency_key = $3
            "#,
        )
        .bind(scope.tenant_id)
        .bind(&scope.action_key)
        .bind(&scope.idempotency_key)
        .fetch_optional(pool)
        .await?;
        Ok(record)
    }

    /// Compare-and-set take-over of an `IN_PROGRESS` record whose lease has expired.
    ///
    /// Returns the updated row if this caller won, `None` if the record moved on
    /// (finished, sealed by its executor, or taken over by someone else).
    pub async fn take_over_expired(
        scope: &IdempotencyScope,
        observed_attempt: i32,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        let record = sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            UPDATE idempotency_records
            SET attempt = attempt + 1,
                lease_expires_at = $5,
                updated_at = $6
            WHERE tenant_id IS NOT DISTINCT FROM $1
              AND action_key = $2
              AND idempotency_key = $3
              AND status = 'in_progress'
              AND attempt = $4
              AND lease_expires_at <= $6
              AND committed_at IS NULL
            RETURNING *
            "#,
        )
        .bind(scope.tenant_id)
        .bind(&scope.action_key)
        .bind(&scope.idempotency_key)
        .bind(observed_attempt)
        .bind(lease_expires_at)
        .bind(now)
        .fetch_optional(pool)
        .await?;
        Ok(record)
    }

    /// Write the terminal outcome for the claimed attempt.
    ///
    /// Returns `false` when the record is no longer `IN_PROGRESS` at that attempt.
    pub async fn finish(
        claim: &IdempotencyClaim,
        outcome: &TerminalOutcome,
        now: DateTime<Utc>,
        pool: &PgPool,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET status = $5,
                response_status = $6,
                response_body = $7,
                completed_at = $8,
                updated_at = $8
            WHERE tenant_id IS NOT DISTINCT FROM $1
              AND action_key = $2
              AND idempotency_key = $3
              AND attempt = $4
              AND status = 'in_progress'
            "#,
        )
        .bind(claim.scope.tenant_id)
        .bind(&claim.scope.action_key)
        .bind(&claim.scope.idempotency_key)
        .bind(claim.attempt)
        .bind(outcome.status)
        .bind(i32::from(outcome.response_status))
        .bind(&outcome.response_body)
        .bind(now)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Seal the claimed attempt inside the command's transaction.
    ///
    /// The row stays locked until that transaction ends, so a concurrent
    /// take-over waits and then sees `committed_at` set. Returns `false` when the
    /// attempt was superseded; the caller must roll back.
    pub async fn seal(
        claim: &IdempotencyClaim,
        response_status: u16,
        response_body: &serde_json::Value,
        now: DateTime<Utc>,
        conn: &mut PgConnection,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET committed_at = $7,
                response_status = $5,
                response_body = $6,
                updated_at = $7
            WHERE tenant_id IS NOT DISTINCT FROM $1
              AND action_key = $2
              AND idempotency_key = $3
              AND attempt = $4
              AND status = 'in_progress'
              AND committed_at IS NULL
            "#,
        )
        .bind(claim.scope.tenant_id)
        .bind(&claim.scope.action_key)
        .bind(&claim.scope.idempotency_key)
        .bind(claim.attempt)
        .bind(i32::from(response_status))
        .bind(response_body)
        .bind(now)
        .execute(conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Delete terminal records completed before `cutoff`.
    pub async fn purge_terminal_before(cutoff: DateTime<Utc>, pool: &PgPool) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE status <> 'in_progress'
              AND completed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// `IN_PROGRESS` records whose lease ran out (crashed executors).
    pub async fn find_stuck(now: DateTime<Utc>, limit: i64, pool: &PgPool) -> Result<Vec<Self>> {
        let records = sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            SELECT * FROM idempotency_records
            WHERE status = 'in_progress'
              AND lease_expires_at <= $1
            ORDER BY created_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(records)
    }
}
