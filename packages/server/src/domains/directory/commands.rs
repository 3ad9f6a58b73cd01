//! Command payloads and their normal forms.
//!
//! The normal form is what gets hashed for mismatch detection, so two requests
//! that differ only in whitespace or letter case of the slug/email are the same
//! request.

use serde::{Deserialize, Serialize};

use crate::common::RestaurantId;
use crate::domains::directory::models::{Lead, Restaurant};
use crate::kernel::error::ValidationError;
use crate::kernel::executor::IdempotentCommand;

pub const CREATE_RESTAURANT: &str = "directory.create-restaurant";
pub const CREATE_LEAD: &str = "directory.create-lead";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRestaurant {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub cuisine: Option<String>,
}

impl IdempotentCommand for CreateRestaurant {
    const ACTION_KEY: &'static str = CREATE_RESTAURANT;
    type Output = Restaurant;

    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("name", &self.name)?;

        let slug = normalize_slug(&self.slug);
        if slug.is_empty() {
            return Err(ValidationError::invalid("slug", "must not be empty"));
        }
        if !slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(ValidationError::invalid(
                "slug",
                "may only contain letters, digits and '-'",
            ));
        }
        Ok(())
    }

    fn normalize(self) -> Self {
        Self {
            name: self.name.trim().to_string(),
            slug: normalize_slug(&self.slug),
            cuisine: normalize_optional(self.cuisine),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateLead {
    pub restaurant_id: RestaurantId,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    pub message: String,
}

impl IdempotentCommand for CreateLead {
    const ACTION_KEY: &'static str = CREATE_LEAD;
    type Output = Lead;

    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("name", &self.name)?;
        require_non_empty("message", &self.message)?;

        let email = self.email.trim();
        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
            _ => Err(ValidationError::invalid("email", "is not a valid address")),
        }
    }

    fn normalize(self) -> Self {
        Self {
            restaurant_id: self.restaurant_id,
            name: self.name.trim().to_string(),
            email: self.email.trim().to_lowercase(),
            phone: normalize_optional(self.phone),
            message: self.message.trim().to_string(),
        }
    }
}

fn normalize_slug(slug: &str) -> String {
    slug.trim().to_lowercase()
}

/// Trimmed; blank becomes `None`.
fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn require_non_empty(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::invalid(field, "must not be empty"));
    }
    Ok(())
}
