#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Billing background worker
//!
//! Handles scheduled jobs:
//! - Billing invariant checks (every 15 minutes)
//! - Replay of failed provider events (every 10 minutes)
//! - Provider event log cleanup (daily at 3:00 AM UTC)
//! - Heartbeat (every 5 minutes)

mod config;
mod jobs;

use std::sync::Arc;

use saasbill_payments::{InvariantChecker, PaymentsService};
use saasbill_shared::{create_pool, PoolSettings};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::WorkerConfig;

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env()?;
    init_tracing(config.json_logs);

    info!(config = ?config, "Starting billing worker");

    let pool = create_pool(
        &config.database_url,
        PoolSettings {
            max_connections: 5,
            ..PoolSettings::default()
        },
    )
    .await?;
    info!("Database pool created");

    let payments = Arc::new(PaymentsService::from_env(pool.clone()));
    let checker = Arc::new(InvariantChecker::new(pool));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Billing invariants every 15 minutes
    let invariant_checker = checker.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let checker = invariant_checker.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                if let Err(e) = jobs::run_invariant_checks(&checker).await {
                    error!(error = %e, "Invariant check run failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (every 15 minutes)");

    // Job 2: Replay failed provider events every 10 minutes
    let replay_payments = payments.clone();
    let replay_batch = config.replay_batch;
    scheduler
        .add(Job::new_async("0 */10 * * * *", move |_uuid, _l| {
            let payments = replay_payments.clone();
            Box::pin(async move {
                if let Err(e) = jobs::replay_failed_events(&payments.webhooks, replay_batch).await {
                    error!(error = %e, "Failed provider event replay failed");
                }
            })
        })?)
        .await?;
    info!(batch = replay_batch, "Scheduled: Failed event replay (every 10 minutes)");

    // Job 3: Event log cleanup daily at 3:00 AM UTC
    let cleanup_payments = payments.clone();
    let retention_days = config.event_retention_days;
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let payments = cleanup_payments.clone();
            Box::pin(async move {
                info!(retention_days = retention_days, "Running provider event log cleanup");
                if let Err(e) = jobs::cleanup_event_log(&payments.webhooks, retention_days).await {
                    error!(error = %e, "Provider event log cleanup failed");
                }
            })
        })?)
        .await?;
    info!(
        retention_days = retention_days,
        "Scheduled: Provider event log cleanup (daily at 3:00 AM UTC)"
    );

    // Job 4: Heartbeat every 5 minutes
    let heartbeat_payments = payments.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let payments = heartbeat_payments.clone();
            Box::pin(async move {
                let provider = payments.provider.state_name().await;
                info!(
                    provider = provider,
                    verifier = payments.webhooks.verifier_state(),
                    "Worker heartbeat"
                );
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    scheduler.start().await?;
    info!("Worker scheduler started");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping scheduler");

    let mut scheduler = scheduler;
    scheduler.shutdown().await?;
    info!("Worker stopped");
    Ok(())
}
