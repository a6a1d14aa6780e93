// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Marketplace Background Worker
//!
//! Handles scheduled jobs including:
//! - Stale stock reservation expiry (every 5 minutes)
//! - Delivery payout settlement for completed deliveries (every 15 minutes)
//! - Retry of failed connected-account transfers (hourly)
//! - Settlement invariant checks (daily at 04:00 UTC)

mod jobs;

use std::time::Duration;

use market_settlement::{InvariantChecker, Settlement};
use market_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::jobs::JobConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Marketplace Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let settlement = Settlement::from_env(pool.clone())?;
    let config = JobConfig::from_env();
    info!(
        reservation_ttl_minutes = config.reservation_ttl.whole_minutes(),
        payout_retry_batch = config.payout_retry_batch,
        "Job configuration loaded"
    );

    let scheduler = JobScheduler::new().await?;

    // Job 1: Release stock held by abandoned checkouts
    let expiry_settlement = settlement.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let settlement = expiry_settlement.clone();
            Box::pin(async move {
                jobs::expire_reservations(&settlement, &config).await;
            })
        })?)
        .await?;
    info!("Scheduled: Reservation expiry (every 5 minutes)");

    // Job 2: Pay couriers for delivered legs
    let delivery_settlement = settlement.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let settlement = delivery_settlement.clone();
            Box::pin(async move {
                info!("Running delivery payout settlement");
                jobs::settle_deliveries(&settlement, &config).await;
            })
        })?)
        .await?;
    info!("Scheduled: Delivery payout settlement (every 15 minutes)");

    // Job 3: Retry transfers that failed at checkout time
    let retry_settlement = settlement.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let settlement = retry_settlement.clone();
            Box::pin(async move {
                info!("Running failed payout retry");
                jobs::retry_failed_payouts(&settlement, &config).await;
            })
        })?)
        .await?;
    info!("Scheduled: Failed payout retry (hourly)");

    // Job 4: Daily invariant sweep
    let invariant_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 4 * * *", move |_uuid, _l| {
            let checker = InvariantChecker::new(invariant_pool.clone());
            Box::pin(async move {
                info!("Running settlement invariant checks");
                jobs::check_invariants(&checker).await;
            })
        })?)
        .await?;
    info!("Scheduled: Settlement invariant checks (04:00 UTC)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Marketplace Worker started successfully with {} scheduled jobs", 4);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
