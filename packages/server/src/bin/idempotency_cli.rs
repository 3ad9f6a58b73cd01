//! Operator CLI for the idempotency store
//!
//! Runs schema migrations, purges expired terminal records and lists records
//! stuck `IN_PROGRESS` past their lease. Outputs JSON on stdout; logs go to stderr.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use server_core::config::Config;
use server_core::domains::idempotency::{IdempotencyCoordinator, IdempotencyRecord, PgIdempotencyStore};
use sqlx::PgPool;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "idempotency_cli")]
#[command(about = "Idempotency store maintenance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,

    /// Delete COMPLETED/FAILED records older than IDEMPOTENCY_RETENTION_HOURS
    Purge,

    /// List IN_PROGRESS records whose lease has expired
    Stuck {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

// ============================================================================
// JSON Response Types
// ============================================================================

#[derive(Serialize)]
struct Response {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    records: Option<Vec<StuckRecord>>,
}

#[derive(Serialize)]
struct StuckRecord {
    tenant_id: Option<String>,
    action_key: String,
    idempotency_key: String,
    attempt: i32,
    lease_expires_at: DateTime<Utc>,
    /// Set when the mutation committed and only `complete` is missing
    committed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<IdempotencyRecord> for StuckRecord {
    fn from(record: IdempotencyRecord) -> Self {
        Self {
            tenant_id: record.tenant_id.map(|t| t.to_string()),
            action_key: record.action_key,
            idempotency_key: record.idempotency_key,
            attempt: record.attempt,
            lease_expires_at: record.lease_expires_at,
            committed_at: record.committed_at,
            created_at: record.created_at,
        }
    }
}

fn output(resp: Response) -> Result<()> {
    println!("{}", serde_json::to_string(&resp)?);
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let pool = get_pool(&config).await?;

    match cli.command {
        Commands::Migrate => cmd_migrate(&pool).await,
        Commands::Purge => cmd_purge(pool, &config).await,
        Commands::Stuck { limit } => cmd_stuck(pool, &config, limit).await,
    }
}

async fn get_pool(config: &Config) -> Result<PgPool> {
    PgPool::connect(&config.database_url)
        .await
        .context("Failed to connect to database")
}

fn coordinator(pool: PgPool, config: &Config) -> IdempotencyCoordinator {
    IdempotencyCoordinator::new(
        Arc::new(PgIdempotencyStore::new(pool)),
        config.idempotency.clone(),
    )
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run migrations")?;

    output(Response {
        success: true,
        message: Some("Migrations applied".to_string()),
        count: None,
        records: None,
    })
}

async fn cmd_purge(pool: PgPool, config: &Config) -> Result<()> {
    let purged = coordinator(pool, config).purge_expired().await?;

    output(Response {
        success: true,
        message: None,
        count: Some(purged),
        records: None,
    })
}

async fn cmd_stuck(pool: PgPool, config: &Config, limit: i64) -> Result<()> {
    let records: Vec<StuckRecord> = coordinator(pool, config)
        .list_stuck(limit)
        .await?
        .into_iter()
        .map(StuckRecord::from)
        .collect();

    output(Response {
        success: true,
        message: None,
        count: Some(records.len() as u64),
        records: Some(records),
    })
}
