// Business domains
pub mod directory;

// Command infrastructure
pub mod idempotency;
