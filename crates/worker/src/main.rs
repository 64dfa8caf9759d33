#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Flowline Background Worker
//!
//! Scheduled jobs for the billing core:
//! - Nightly invariant sweep (2:10 UTC): runs every consistency check and
//!   logs violations at a severity-appropriate level.
//! - Hourly stale-event report: events still `received` after an hour mean
//!   the provider stopped redelivering or a handler died mid-flight; they
//!   need a human or a manual replay, never an automatic mutation.

use std::sync::Arc;
use std::time::Duration;

use flowline_billing::{InvariantChecker, ViolationSeverity};
use sqlx::postgres::PgPoolOptions;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

async fn run_invariant_sweep(checker: &InvariantChecker) {
    match checker.run_all_checks().await {
        Ok(summary) => {
            info!(
                checks_run = summary.checks_run,
                checks_passed = summary.checks_passed,
                violations = summary.violations.len(),
                healthy = summary.healthy,
                "Invariant sweep complete"
            );
            for violation in &summary.violations {
                match violation.severity {
                    ViolationSeverity::Critical | ViolationSeverity::High => {
                        error!(
                            invariant = %violation.invariant,
                            severity = %violation.severity,
                            description = %violation.description,
                            context = %violation.context,
                            "Invariant violation"
                        );
                    }
                    ViolationSeverity::Medium | ViolationSeverity::Low => {
                        warn!(
                            invariant = %violation.invariant,
                            severity = %violation.severity,
                            description = %violation.description,
                            "Invariant violation"
                        );
                    }
                }
            }
        }
        Err(e) => error!(error = %e, "Invariant sweep failed"),
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StaleEvent {
    provider: String,
    event_id: String,
    received_at: OffsetDateTime,
}

/// Report events stuck in `received`. Read-only: the ledger is only ever
/// mutated by the webhook handlers themselves.
async fn report_stale_events(pool: &sqlx::PgPool) {
    let stale: Result<Vec<StaleEvent>, _> = sqlx::query_as(
        r#"
        SELECT provider, event_id, received_at
        FROM webhook_events
        WHERE status = 'received'
          AND received_at < NOW() - INTERVAL '1 hour'
        ORDER BY received_at
        LIMIT 50
        "#,
    )
    .fetch_all(pool)
    .await;

    match stale {
        Ok(events) if events.is_empty() => {
            info!("No stale webhook events");
        }
        Ok(events) => {
            warn!(count = events.len(), "Stale webhook events found");
            for event in events {
                warn!(
                    provider = %event.provider,
                    event_id = %event.event_id,
                    received_at = %event.received_at,
                    "Event stuck in received - provider redelivery may have stopped"
                );
            }
        }
        Err(e) => error!(error = %e, "Stale event query failed"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Flowline Worker");

    let pool = create_db_pool().await?;
    let checker = Arc::new(InvariantChecker::new(pool.clone()));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Nightly invariant sweep at 2:10 UTC
    let sweep_checker = Arc::clone(&checker);
    scheduler
        .add(Job::new_async("0 10 2 * * *", move |_uuid, _l| {
            let checker = Arc::clone(&sweep_checker);
            Box::pin(async move {
                info!("Running scheduled invariant sweep");
                run_invariant_sweep(&checker).await;
            })
        })?)
        .await?;
    info!("Scheduled: Invariant sweep (daily at 2:10 UTC)");

    // Job 2: Stale-event report every hour at :05
    let report_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 5 * * * *", move |_uuid, _l| {
            let pool = report_pool.clone();
            Box::pin(async move {
                report_stale_events(&pool).await;
            })
        })?)
        .await?;
    info!("Scheduled: Stale webhook event report (hourly)");

    scheduler.start().await?;
    info!("Worker running");

    // Run one sweep at startup so a fresh deploy reports immediately.
    run_invariant_sweep(&checker).await;

    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        info!("Worker heartbeat");
    }
}
