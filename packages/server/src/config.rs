use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub idempotency: IdempotencyConfig,
}

/// Tuning for the idempotency coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyConfig {
    /// How long an `IN_PROGRESS` record is owned by its executor before another
    /// request with the same key may take it over.
    pub lease: Duration,
    /// Back-off hint returned to callers that hit an in-flight duplicate.
    pub retry_after: Duration,
    /// How long terminal records are kept before `purge_expired` removes them.
    pub retention: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(300),
            retry_after: Duration::from_millis(1000),
            retention: Duration::from_secs(7 * 24 * 60 * 60), // 7 days
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            idempotency: IdempotencyConfig::from_env()?,
        })
    }
}

impl IdempotencyConfig {
    /// Read overrides from the environment, falling back to the defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let lease = match env::var("IDEMPOTENCY_LEASE_SECONDS") {
            Ok(raw) => Duration::from_secs(
                raw.parse()
                    .context("IDEMPOTENCY_LEASE_SECONDS must be a valid number")?,
            ),
            Err(_) => defaults.lease,
        };

        let retry_after = match env::var("IDEMPOTENCY_RETRY_AFTER_MS") {
            Ok(raw) => Duration::from_millis(
                raw.parse()
                    .context("IDEMPOTENCY_RETRY_AFTER_MS must be a valid number")?,
            ),
            Err(_) => defaults.retry_after,
        };

        let retention = match env::var("IDEMPOTENCY_RETENTION_HOURS") {
            Ok(raw) => retention_from_hours(
                raw.parse()
                    .context("IDEMPOTENCY_RETENTION_HOURS must be a valid number")?,
            )?,
            Err(_) => defaults.retention,
        };

        Ok(Self {
            lease,
            retry_after,
            retention,
        })
    }
}

fn retention_from_hours(hours: u64) -> Result<Duration> {
    let secs = hours
        .checked_mul(60 * 60)
        .context("IDEMPOTENCY_RETENTION_HOURS is too large")?;
    Ok(Duration::from_secs(secs))
}
