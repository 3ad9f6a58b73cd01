// Restaurant Directory - Command Core
//
// Idempotent command execution with a transactional outbox. Every mutating
// command is deduplicated by idempotency key, runs its domain writes, outbox
// events and audit row in one transaction, and replays its stored response on
// retry.
//
// Commands are organized per-domain in domains/*/actions/

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;

pub use config::*;
