//! Typed ID definitions for the entities this server touches.

pub use super::id::Id;

// ============================================================================
// Entity marker types
// ============================================================================

/// Marker type for tenants (one directory per tenant).
pub struct Tenant;

/// Marker type for authenticated users issuing commands.
pub struct User;

/// Marker type for Restaurant entities.
pub struct Restaurant;

/// Marker type for Lead entities (contact requests sent to a restaurant).
pub struct Lead;

/// Marker type for rows in the transactional outbox.
pub struct OutboxRow;

/// Marker type for audit log rows.
pub struct AuditRow;

/// Marker type for idempotency records.
pub struct IdempotencyRow;

// ============================================================================
// Type aliases - the primary API
// ============================================================================

pub type TenantId = Id<Tenant>;
pub type UserId = Id<User>;
pub type RestaurantId = Id<Restaurant>;
pub type LeadId = Id<Lead>;
pub type OutboxEventId = Id<OutboxRow>;
pub type AuditEntryId = Id<AuditRow>;
pub type IdempotencyRecordId = Id<IdempotencyRow>;
