// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Strom Core - Durable Coordination Engine
//!
//! The standalone engine process: runs the execution reconciler, the
//! liveness monitor and the window correlator against one database.
//! Workers and submitters are separate processes sharing the same
//! database through the strom-core library.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::watch;
use tracing::{error, info};

use strom_core::clock::SystemClock;
use strom_core::config::Config;
use strom_core::correlator::Correlator;
use strom_core::executor::{Executor, NoConcurrency};
use strom_core::storage::{PostgresStorage, SqliteStorage, Storage};
use strom_core::tracker::LivenessMonitor;
use strom_model::EmptyResolver;

/// Interval of the liveness and window sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("strom_core=info".parse().unwrap()),
        )
        .init();

    info!("Starting Strom Core");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        tenant = %config.tenant_id,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        heartbeat_timeout_s = config.heartbeat_timeout.as_secs(),
        max_job_attempts = config.max_job_attempts,
        "Configuration loaded"
    );

    // Connect and migrate, picking the backend from the URL scheme.
    info!("Connecting to database...");
    let storage: Arc<dyn Storage> = if config.database_url.starts_with("sqlite") {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&config.database_url)
            .await?;
        info!("Running database migrations...");
        strom_core::migrations::run_sqlite(&pool).await?;
        Arc::new(SqliteStorage::new(pool))
    } else {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await?;
        info!("Running database migrations...");
        strom_core::migrations::run_postgres(&pool).await?;
        Arc::new(PostgresStorage::new(pool))
    };
    info!("Database ready");

    let clock = Arc::new(SystemClock);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Task and flow settings come from the embedding product; the
    // standalone binary runs with empty registries.
    let executor = Arc::new(Executor::new(
        storage.clone(),
        Arc::new(EmptyResolver),
        Arc::new(NoConcurrency),
    ));
    let correlator = Arc::new(Correlator::new(storage.clone(), clock.clone()));
    let monitor = LivenessMonitor::new(
        storage.clone(),
        clock,
        config.heartbeat_timeout,
        config.max_job_attempts,
    );

    let executor_handle = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        let poll_interval = config.poll_interval;
        async move { executor.run(poll_interval, shutdown).await }
    });

    let correlator_handle = tokio::spawn({
        let correlator = correlator.clone();
        let shutdown = shutdown_rx.clone();
        let poll_interval = config.poll_interval;
        async move { correlator.run(poll_interval, shutdown).await }
    });

    let sweeper_handle = tokio::spawn({
        let tenant = config.tenant_id.clone();
        let shutdown = shutdown_rx.clone();
        async move { correlator.run_sweeper(tenant, SWEEP_INTERVAL, shutdown).await }
    });

    let monitor_handle = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { monitor.run(SWEEP_INTERVAL, shutdown).await }
    });

    info!("Strom Core initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(
        executor_handle,
        correlator_handle,
        sweeper_handle,
        monitor_handle
    );

    info!("Shutdown complete");
    Ok(())
}
