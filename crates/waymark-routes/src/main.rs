// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Waymark Routes - Reconciliation Server
//!
//! Runs the reconciliation consumers that apply processed images to routes:
//! - Consumes `image:result` in the reconciler consumer group
//! - Confirms waypoints and rescales their markers
//! - Moves routes to `ready` once every waypoint is confirmed
//!
//! Processing workers need an image processor and are started by embedding
//! [`waymark_routes::runtime::PipelineRuntime`] instead.

use tracing::{info, warn};

use waymark_routes::config::Config;
use waymark_routes::migrations;
use waymark_routes::rescale::MarkerRescale;
use waymark_routes::runtime::PipelineRuntimeBuilder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "waymark_routes=info,waymark_queue=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        redis_url = %config.redis_url,
        reconciler_group = %config.reconciler_group,
        reconcilers = config.reconcilers,
        consumer_prefix = %config.consumer_prefix,
        "Starting Waymark Routes"
    );

    if MarkerRescale::new(config.marker_precision).collapses_normalized() {
        warn!(
            "WAYMARK_MARKER_PRECISION is 0: confirmed markers will be rounded to whole numbers, \
             which collapses normalized markers to 0 or 1"
        );
    }

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    migrations::run(&pool).await?;

    info!("Database migrations applied");

    let runtime = PipelineRuntimeBuilder::from_config(&config)
        .pool(pool)
        .build()?
        .start()
        .await?;

    info!(reconcilers = runtime.reconcilers(), "Reconciliation server ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Waymark Routes shut down");

    Ok(())
}
