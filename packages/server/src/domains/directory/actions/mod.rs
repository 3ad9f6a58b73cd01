pub mod create_lead;
pub mod create_restaurant;

pub use create_lead::create_lead;
pub use create_restaurant::{create_restaurant, SLUG_ALREADY_EXISTS};
