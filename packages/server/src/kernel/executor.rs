//! The idempotent command protocol.
//!
//! Every mutating command goes through [`execute_command`]:
//!
//! 1. Validate structural preconditions (tenant scope, idempotency key, command
//!    fields). Nothing touches the idempotency store when this fails.
//! 2. Normalize the command and hash it.
//! 3. Ask the [`IdempotencyCoordinator`](crate::domains::idempotency::IdempotencyCoordinator)
//!    for a decision.
//! 4. Only `Started` proceeds; every other decision returns immediately.
//! 5. Open a transaction: run the mutation (which re-checks its own invariants
//!    with the transaction handle), enqueue its outbox events, write the audit
//!    row, then seal the claim. A superseded claim rolls everything back.
//! 6. After commit, `complete` the record with the response.
//! 7. On any error from step 5, `fail` the record best-effort and return the
//!    original error.
//!
//! The terminal idempotency write always happens after the transaction has
//! committed or rolled back. A crash in between leaves the record
//! `IN_PROGRESS` until its lease expires, never `COMPLETED` for a mutation that
//! did not happen. The seal written in step 5 makes that gap recoverable: the
//! next request completes the record from it instead of executing again.

use anyhow::Context;
use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{error, info, warn};
use typed_builder::TypedBuilder;

use crate::common::utils::generate_request_hash;
use crate::common::{AuditEntryId, TenantId, UserId};
use crate::domains::idempotency::{Decision, IdempotencyRequest, IdempotencyScope};
use crate::kernel::audit::NewAuditEntry;
use crate::kernel::deps::ServerDeps;
use crate::kernel::error::{CommandError, ValidationError};
use crate::kernel::outbox::{CorrelationId, OutboxEvent, PendingEvent};
use crate::kernel::unit_of_work::within_transaction;

/// Whether a command must run inside a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantScope {
    Tenant,
    /// Platform-wide action; the idempotency record has no tenant.
    Platform,
}

/// A mutating command that is deduplicated by idempotency key.
pub trait IdempotentCommand: Serialize + Send + Sync + 'static {
    /// Stable identifier of the command type, e.g. `"directory.create-lead"`.
    const ACTION_KEY: &'static str;

    const TENANT_SCOPE: TenantScope = TenantScope::Tenant;

    /// Status recorded and returned on success.
    const SUCCESS_STATUS: u16 = 201;

    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Field-level checks, run before the idempotency store is consulted.
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }

    /// Deterministic normal form (trimmed strings, lower-cased slugs, ...).
    /// Semantically identical requests must normalize to equal values.
    fn normalize(self) -> Self;
}

/// Request-scoped metadata supplied by the caller (HTTP layer, worker, test).
#[derive(Debug, Clone, TypedBuilder)]
pub struct CommandContext {
    #[builder(default, setter(strip_option))]
    pub tenant_id: Option<TenantId>,
    #[builder(default, setter(strip_option))]
    pub user_id: Option<UserId>,
    /// Value of the `Idempotency-Key` header.
    #[builder(default, setter(strip_option, into))]
    pub idempotency_key: Option<String>,
    #[builder(default = CorrelationId::new())]
    pub correlation_id: CorrelationId,
}

/// What the mutation closure receives.
#[derive(Debug, Clone)]
pub struct MutationInput<C> {
    /// The normalized command.
    pub command: C,
    pub tenant_id: Option<TenantId>,
    pub user_id: Option<UserId>,
    pub correlation_id: CorrelationId,
}

impl<C> MutationInput<C> {
    pub fn tenant(&self) -> Result<TenantId, CommandError> {
        self.tenant_id
            .ok_or_else(|| ValidationError::TenantRequired.into())
    }
}

/// Result of a mutation: the response plus the events to enqueue with it.
#[derive(Debug, Clone)]
pub struct Mutation<T> {
    pub output: T,
    pub events: Vec<PendingEvent>,
}

impl<T> Mutation<T> {
    pub fn new(output: T) -> Self {
        Self {
            output,
            events: Vec::new(),
        }
    }

    pub fn with_event<E: OutboxEvent>(mut self, event: &E) -> anyhow::Result<Self> {
        self.events.push(PendingEvent::from_event(event)?);
        Ok(self)
    }
}

/// Response of an executed (or replayed) command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse<T> {
    pub status: u16,
    pub body: T,
    /// `true` when the body came from the idempotency record, not a fresh execution.
    pub replayed: bool,
}

/// Run `command` through the idempotency protocol.
///
/// `mutation` performs the domain writes with the transaction handle it is
/// given. Domain invariants (uniqueness, existence) must be re-checked there,
/// with the same handle, and reported as `CommandError`s; any error rolls the
/// transaction back and marks the idempotency record `FAILED`.
///
/// ```ignore
/// execute_command(deps, ctx, cmd, move |tx, input| {
///     Box::pin(async move {
///         let lead = repo.insert_lead(&input.command, tx).await?;
///         Mutation::new(lead.clone()).with_event(&LeadCreated::from(&lead)).map_err(Into::into)
///     })
/// })
/// .await
/// ```
pub async fn execute_command<C, Tx, F>(
    deps: &ServerDeps<Tx>,
    ctx: &CommandContext,
    command: C,
    mutation: F,
) -> Result<CommandResponse<C::Output>, CommandError>
where
    C: IdempotentCommand,
    Tx: Send + 'static,
    F: for<'t> FnOnce(&'t mut Tx, MutationInput<C>) -> BoxFuture<'t, Result<Mutation<C::Output>, CommandError>>
        + Send
        + 'static,
{
    let idempotency_key = validate_preconditions::<C>(ctx)?;
    command.validate()?;

    let command = command.normalize();
    let request_hash =
        generate_request_hash(&command).context("failed to hash normalized command")?;

    let request = IdempotencyRequest {
        scope: IdempotencyScope::new(ctx.tenant_id, C::ACTION_KEY, idempotency_key),
        request_hash: Some(request_hash),
        user_id: ctx.user_id,
    };

    let claim = match deps.idempotency.start_or_replay(&request).await? {
        Decision::Started(claim) => claim,
        Decision::Replay {
            response_status,
            response_body,
        } => {
            info!(
                action_key = C::ACTION_KEY,
                tenant_id = ?ctx.tenant_id,
                idempotency_key = %request.scope.idempotency_key,
                "Replaying stored response"
            );
            let body = serde_json::from_value(response_body)
                .context("stored response does not match the command output")?;
            return Ok(CommandResponse {
                status: response_status,
                body,
                replayed: true,
            });
        }
        Decision::Failed {
            response_status,
            response_body,
        } => {
            return Err(CommandError::PreviouslyFailed {
                response_status,
                response_body,
            });
        }
        Decision::InProgress { retry_after_ms } => {
            return Err(CommandError::IdempotencyInProgress { retry_after_ms });
        }
        Decision::Mismatch => return Err(CommandError::IdempotencyKeyReusedWithDifferentPayload),
    };

    info!(
        action_key = C::ACTION_KEY,
        tenant_id = ?ctx.tenant_id,
        idempotency_key = %claim.scope.idempotency_key,
        attempt = claim.attempt,
        correlation_id = %ctx.correlation_id,
        "Executing command"
    );

    let claim_fence = deps.claim_fence.clone();
    let outbox = deps.outbox.clone();
    let audit_log = deps.audit_log.clone();
    let sealed_claim = claim.clone();
    let retry_after_ms = u64::try_from(deps.idempotency.config().retry_after.as_millis())
        .unwrap_or(u64::MAX)
        .max(1);
    let tenant_id = ctx.tenant_id;
    let actor_id = ctx.user_id;
    let correlation_id = ctx.correlation_id;
    let idempotency_key = claim.scope.idempotency_key.clone();
    let input = MutationInput {
        command,
        tenant_id,
        user_id: actor_id,
        correlation_id,
    };

    let result = within_transaction(deps.unit_of_work.as_ref(), move |tx| {
        Box::pin(async move {
            let Mutation { output, events } = mutation(&mut *tx, input).await?;

            let body = serde_json::to_value(&output).context("failed to serialize command response")?;

            for event in events {
                outbox
                    .enqueue(&event.stamp(tenant_id, correlation_id), &mut *tx)
                    .await?;
            }

            audit_log
                .record(
                    &NewAuditEntry {
                        id: AuditEntryId::new(),
                        tenant_id,
                        actor_id,
                        action_key: C::ACTION_KEY.to_string(),
                        idempotency_key,
                        correlation_id,
                        details: body.clone(),
                        created_at: chrono::Utc::now(),
                    },
                    &mut *tx,
                )
                .await?;

            let sealed = claim_fence
                .seal(
                    &sealed_claim,
                    C::SUCCESS_STATUS,
                    &body,
                    chrono::Utc::now(),
                    &mut *tx,
                )
                .await?;
            if !sealed {
                // Lease ran out and another request took the key over
                return Err(CommandError::IdempotencyInProgress { retry_after_ms });
            }

            Ok::<_, CommandError>((output, body))
        })
    })
    .await;

    match result {
        Ok((output, body)) => {
            if let Err(e) = deps
                .idempotency
                .complete(&claim, C::SUCCESS_STATUS, body)
                .await
            {
                // Committed and sealed; the first request after the lease runs out completes it
                error!(
                    action_key = C::ACTION_KEY,
                    idempotency_key = %claim.scope.idempotency_key,
                    error = %e,
                    "Failed to record completed command"
                );
            }

            Ok(CommandResponse {
                status: C::SUCCESS_STATUS,
                body: output,
                replayed: false,
            })
        }
        Err(err) => {
            warn!(
                action_key = C::ACTION_KEY,
                idempotency_key = %claim.scope.idempotency_key,
                code = err.code(),
                error = %err,
                "Command failed"
            );

            if let Err(e) = deps
                .idempotency
                .fail(&claim, err.status_code(), err.response_body())
                .await
            {
                warn!(
                    action_key = C::ACTION_KEY,
                    idempotency_key = %claim.scope.idempotency_key,
                    error = %e,
                    "Failed to record command failure"
                );
            }

            Err(err)
        }
    }
}

/// Step 1: tenant scope and idempotency key. Returns the trimmed key.
fn validate_preconditions<C: IdempotentCommand>(
    ctx: &CommandContext,
) -> Result<String, ValidationError> {
    if C::TENANT_SCOPE == TenantScope::Tenant && ctx.tenant_id.is_none() {
        return Err(ValidationError::TenantRequired);
    }

    match ctx.idempotency_key.as_deref().map(str::trim) {
        Some(key) if !key.is_empty() => Ok(key.to_string()),
        _ => Err(ValidationError::IdempotencyKeyRequired),
    }
}
