//! Directory domain - restaurants and the leads left for them.
//!
//! Both mutations run through the idempotent command executor.

pub mod actions;
pub mod commands;
pub mod events;
pub mod models;
pub mod repository;

pub use actions::{create_lead, create_restaurant, SLUG_ALREADY_EXISTS};
pub use commands::{CreateLead, CreateRestaurant, CREATE_LEAD, CREATE_RESTAURANT};
pub use events::{LeadCreated, RestaurantCreated};
pub use models::{Lead, NewLead, NewRestaurant, Restaurant};
pub use repository::{DirectoryRepository, PgDirectoryRepository};
