//! Events emitted by directory commands through the outbox.

use serde::{Deserialize, Serialize};

use crate::common::{LeadId, RestaurantId};
use crate::domains::directory::models::{Lead, Restaurant};
use crate::kernel::outbox::OutboxEvent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestaurantCreated {
    pub restaurant_id: RestaurantId,
    pub name: String,
    pub slug: String,
}

impl OutboxEvent for RestaurantCreated {
    fn event_type() -> &'static str {
        "directory.restaurant_created.v1"
    }
}

impl From<&Restaurant> for RestaurantCreated {
    fn from(restaurant: &Restaurant) -> Self {
        Self {
            restaurant_id: restaurant.id,
            name: restaurant.name.clone(),
            slug: restaurant.slug.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadCreated {
    pub lead_id: LeadId,
    pub restaurant_id: RestaurantId,
    pub email: String,
}

impl OutboxEvent for LeadCreated {
    fn event_type() -> &'static str {
        "directory.lead_created.v1"
    }
}

impl From<&Lead> for LeadCreated {
    fn from(lead: &Lead) -> Self {
        Self {
            lead_id: lead.id,
            restaurant_id: lead.restaurant_id,
            email: lead.email.clone(),
        }
    }
}
