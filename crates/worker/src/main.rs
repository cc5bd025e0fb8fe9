// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! NAGOYAMESHI Background Worker
//!
//! Handles scheduled jobs including:
//! - Pruning of processed webhook event records past the retention window

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use nagoyameshi_billing::{IdempotencyLedger, PgIdempotencyLedger};
use nagoyameshi_shared::create_pool;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

const DEFAULT_RETENTION_DAYS: i64 = 90;
const DEFAULT_PRUNE_CRON: &str = "0 30 3 * * *";

/// Worker configuration loaded from environment variables
#[derive(Debug, Clone)]
struct WorkerConfig {
    database_url: String,
    /// Processed event records older than this are deleted
    retention_days: i64,
    prune_cron: String,
}

impl WorkerConfig {
    fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let retention_days = match std::env::var("LEDGER_RETENTION_DAYS") {
            Ok(raw) => raw
                .trim()
                .parse::<i64>()
                .ok()
                .filter(|days| *days > 0)
                .with_context(|| {
                    format!("LEDGER_RETENTION_DAYS must be a positive number of days, got {raw:?}")
                })?,
            Err(_) => DEFAULT_RETENTION_DAYS,
        };

        let prune_cron = std::env::var("LEDGER_PRUNE_CRON")
            .map(|cron| cron.trim().to_string())
            .ok()
            .filter(|cron| !cron.is_empty())
            .unwrap_or_else(|| DEFAULT_PRUNE_CRON.to_string());

        Ok(Self {
            database_url,
            retention_days,
            prune_cron,
        })
    }
}

/// Delete event records processed more than `retention_days` before `now`.
/// Checkout session keys survive; see [`IdempotencyLedger::prune_older_than`].
async fn prune_ledger(
    ledger: &dyn IdempotencyLedger,
    retention_days: i64,
    now: OffsetDateTime,
) -> anyhow::Result<u64> {
    let cutoff = now - time::Duration::days(retention_days);
    let deleted = ledger.prune_older_than(cutoff).await?;
    info!(deleted = deleted, cutoff = %cutoff, "Processed webhook event records pruned");
    Ok(deleted)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting NAGOYAMESHI Worker");

    let config = WorkerConfig::from_env()?;
    let pool = create_pool(&config.database_url, 2).await?;
    info!("Database pool created");

    let ledger: Arc<dyn IdempotencyLedger> = Arc::new(PgIdempotencyLedger::new(pool));

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Prune the idempotency ledger
    let retention_days = config.retention_days;
    let prune_ledger_handle = ledger.clone();
    scheduler
        .add(Job::new_async(config.prune_cron.as_str(), move |_uuid, _l| {
            let ledger = prune_ledger_handle.clone();
            Box::pin(async move {
                info!("Running processed webhook event pruning");
                if let Err(e) =
                    prune_ledger(ledger.as_ref(), retention_days, OffsetDateTime::now_utc()).await
                {
                    error!(error = %e, "Processed webhook event pruning failed");
                }
            })
        })?)
        .await?;
    info!(
        cron = %config.prune_cron,
        retention_days = retention_days,
        "Scheduled: Processed webhook event pruning"
    );

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("NAGOYAMESHI Worker started successfully");

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
