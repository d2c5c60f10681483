//! Lot expiry sweeper
//!
//! One-shot job that applies lazy expiry to every lot with an elapsed
//! deadline: lapsed priority holds, reservations past their term, counter-
//! offers past their validity and promotions past their end. Reads already
//! expire lazily; this job makes sure lots nobody reads still roll back.
//!
//! Run it from an external scheduler (cron, a Kubernetes `CronJob`). It exits
//! non-zero when any lot could not be swept.
//!
//! # Usage
//!
//! ```bash
//! DATABASE_URL=postgres://localhost/lotes cargo run -p lotes-sweeper
//! ```

mod config;

use config::Config;
use lotes_core::environment::SystemClock;
use lotes_core::retry::{RetryPolicy, retry_transient};
use lotes_core::service::LotService;
use lotes_postgres::PostgresLotStore;
use sqlx::postgres::PgPoolOptions;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    // Load .env file
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,lotes=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!(
        max_connections = config.postgres.max_connections,
        run_migrations = config.sweep.run_migrations,
        max_retries = config.sweep.max_retries,
        "Configuration loaded"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.postgres.max_connections)
        .acquire_timeout(Duration::from_secs(config.postgres.connect_timeout))
        .connect(&config.postgres.url)
        .await?;
    let store = PostgresLotStore::new(pool)
        .with_lock_timeout(Duration::from_millis(config.postgres.lock_timeout_ms));

    if config.sweep.run_migrations {
        store.migrate().await?;
        tracing::info!("Migrations applied");
    }

    let service = LotService::new(store, Arc::new(SystemClock));
    let policy = RetryPolicy::default().with_max_retries(config.sweep.max_retries);
    let report = retry_transient(policy, || service.sweep_expired()).await?;

    tracing::info!(
        lots = report.lots,
        failed = report.failed,
        holds = report.expired.holds,
        reservations = report.expired.reservations,
        offers = report.expired.offers,
        promotions = report.expired.promotions,
        "Sweep complete"
    );

    if report.failed > 0 {
        tracing::warn!(failed = report.failed, "Some lots were not swept");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
