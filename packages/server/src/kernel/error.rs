//! Error taxonomy for idempotent commands.
//!
//! Every [`CommandError`] knows three things about itself:
//!
//! - its HTTP-equivalent status ([`CommandError::status_code`]),
//! - a stable machine-readable code ([`CommandError::code`]),
//! - the JSON body a client is allowed to see ([`CommandError::response_body`]).
//!
//! The response body is what gets written to the idempotency record when a command
//! fails, and what is replayed verbatim to any later request with the same key.
//! Internal and database errors therefore only ever expose a generic message.

use serde_json::{json, Value};
use thiserror::Error;

/// Structural precondition failures. Raised before the idempotency store is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Idempotency key required")]
    IdempotencyKeyRequired,

    #[error("Tenant scope required")]
    TenantRequired,

    #[error("Invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ValidationError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::IdempotencyKeyRequired => "IDEMPOTENCY_KEY_REQUIRED",
            ValidationError::TenantRequired => "TENANT_REQUIRED",
            ValidationError::InvalidField { .. } => "VALIDATION_ERROR",
        }
    }
}

/// Errors surfaced by [`execute_command`](crate::kernel::execute_command).
#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Another request with the same idempotency key is still executing.
    #[error("Request with this idempotency key is still in progress, retry after {retry_after_ms}ms")]
    IdempotencyInProgress { retry_after_ms: u64 },

    /// The idempotency key was already used for a different payload.
    #[error("Idempotency key was reused with a different payload")]
    IdempotencyKeyReusedWithDifferentPayload,

    /// Domain conflict raised inside the transaction (e.g. `SLUG_ALREADY_EXISTS`).
    #[error("{message}")]
    Conflict { code: &'static str, message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A previous attempt with this idempotency key failed; this is its stored response.
    #[error("Command previously failed with status {response_status}")]
    PreviouslyFailed {
        response_status: u16,
        response_body: Value,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CommandError {
    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::Conflict {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// HTTP-equivalent status for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            CommandError::Validation(_) => 400,
            CommandError::IdempotencyInProgress { .. } => 409,
            CommandError::IdempotencyKeyReusedWithDifferentPayload => 409,
            CommandError::Conflict { .. } => 409,
            CommandError::NotFound { .. } => 404,
            CommandError::PreviouslyFailed {
                response_status, ..
            } => *response_status,
            CommandError::Database(_) | CommandError::Internal(_) => 500,
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &str {
        match self {
            CommandError::Validation(e) => e.code(),
            CommandError::IdempotencyInProgress { .. } => "IDEMPOTENCY_IN_PROGRESS",
            CommandError::IdempotencyKeyReusedWithDifferentPayload => {
                "IDEMPOTENCY_KEY_REUSED_WITH_DIFFERENT_PAYLOAD"
            }
            CommandError::Conflict { code, .. } => *code,
            CommandError::NotFound { .. } => "NOT_FOUND",
            CommandError::PreviouslyFailed { response_body, .. } => response_body
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or("PREVIOUSLY_FAILED"),
            CommandError::Database(_) | CommandError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Client-safe JSON body. Stored on `fail()` and replayed verbatim.
    pub fn response_body(&self) -> Value {
        match self {
            CommandError::PreviouslyFailed { response_body, .. } => response_body.clone(),
            CommandError::IdempotencyInProgress { retry_after_ms } => json!({
                "code": self.code(),
                "message": self.to_string(),
                "retryAfterMs": retry_after_ms,
            }),
            // Never expose internal details
            CommandError::Database(_) | CommandError::Internal(_) => json!({
                "code": self.code(),
                "message": "An internal error occurred",
            }),
            _ => json!({
                "code": self.code(),
                "message": self.to_string(),
            }),
        }
    }

    /// Whether retrying with the same idempotency key can ever succeed.
    pub fn is_retryable_with_same_key(&self) -> bool {
        matches!(self, CommandError::IdempotencyInProgress { .. })
    }
}
