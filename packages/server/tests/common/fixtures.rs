//! Test fixtures for building commands and request contexts.

use server_core::common::{RestaurantId, TenantId, UserId};
use server_core::domains::directory::{CreateLead, CreateRestaurant};
use server_core::kernel::CommandContext;

/// Request context for a tenant-scoped command.
pub fn tenant_ctx(tenant_id: TenantId, idempotency_key: &str) -> CommandContext {
    CommandContext::builder()
        .tenant_id(tenant_id)
        .user_id(UserId::new())
        .idempotency_key(idempotency_key)
        .build()
}

pub fn create_restaurant_cmd(name: &str, slug: &str) -> CreateRestaurant {
    CreateRestaurant {
        name: name.to_string(),
        slug: slug.to_string(),
        cuisine: Some("Vietnamese".to_string()),
    }
}

pub fn create_lead_cmd(restaurant_id: RestaurantId, email: &str) -> CreateLead {
    CreateLead {
        restaurant_id,
        name: "Ada Lovelace".to_string(),
        email: email.to_string(),
        phone: None,
        message: "Do you cater for 40 people?".to_string(),
    }
}
