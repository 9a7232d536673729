// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for waymark-routes.

use std::time::Duration;

use waymark_queue::guard::DEFAULT_GUARD_TTL;
use waymark_queue::keys::DEFAULT_WORKER_GROUP;
use waymark_queue::status::MAX_STATUS_TTL;

/// Default consumer group of the reconciliation consumers on `image:result`.
pub const DEFAULT_RECONCILER_GROUP: &str = "route-reconciler";

/// Pipeline configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Redis/Valkey URL for streams, guard keys and status hashes.
    pub redis_url: String,
    /// TTL of `image:status:{id}` hashes.
    pub status_ttl: Duration,
    /// TTL of `image:upload:{id}` guard keys.
    pub upload_guard_ttl: Duration,
    /// Consumer group of processing workers on `image:process`.
    pub worker_group: String,
    /// Consumer group of reconciliation consumers on `image:result`.
    pub reconciler_group: String,
    /// Prefix for consumer names started by this process.
    pub consumer_prefix: String,
    /// Number of reconciliation consumers to run.
    pub reconcilers: usize,
    /// Entries per read.
    pub batch_size: usize,
    /// Upper bound on one blocking read.
    pub block_timeout: Duration,
    /// Idle time before a pending entry is reclaimed.
    pub reclaim_min_idle: Duration,
    /// How often each consumer sweeps the pending list.
    pub reclaim_interval: Duration,
    /// Decimal places kept when rescaling markers.
    ///
    /// The default `0` rounds normalized markers to `0` or `1`; see
    /// [`MarkerRescale`](crate::rescale::MarkerRescale).
    pub marker_precision: u32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("WAYMARK_DATABASE_URL")
            .ok_or(ConfigError::MissingEnvVar("WAYMARK_DATABASE_URL"))?;

        let redis_url =
            lookup("WAYMARK_REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string());

        let status_ttl_secs: u64 = parse_or(
            &lookup,
            "WAYMARK_STATUS_TTL_SECS",
            MAX_STATUS_TTL.as_secs(),
        )?;
        if status_ttl_secs == 0 || status_ttl_secs > MAX_STATUS_TTL.as_secs() {
            return Err(ConfigError::OutOfRange {
                var: "WAYMARK_STATUS_TTL_SECS",
                reason: format!("must be between 1 and {}", MAX_STATUS_TTL.as_secs()),
            });
        }

        let upload_guard_ttl_secs: u64 = parse_or(
            &lookup,
            "WAYMARK_UPLOAD_GUARD_TTL_SECS",
            DEFAULT_GUARD_TTL.as_secs(),
        )?;
        if upload_guard_ttl_secs == 0 {
            return Err(ConfigError::OutOfRange {
                var: "WAYMARK_UPLOAD_GUARD_TTL_SECS",
                reason: "must be greater than 0".to_string(),
            });
        }

        let worker_group =
            lookup("WAYMARK_WORKER_GROUP").unwrap_or_else(|| DEFAULT_WORKER_GROUP.to_string());
        let reconciler_group = lookup("WAYMARK_RECONCILER_GROUP")
            .unwrap_or_else(|| DEFAULT_RECONCILER_GROUP.to_string());
        if worker_group == reconciler_group {
            return Err(ConfigError::SharedConsumerGroup(worker_group));
        }

        let consumer_prefix = lookup("WAYMARK_CONSUMER_PREFIX").unwrap_or_else(|| {
            format!(
                "waymark-{}",
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            )
        });

        let reconcilers: usize = parse_or(&lookup, "WAYMARK_RECONCILERS", 1)?;
        let batch_size: usize = parse_or(&lookup, "WAYMARK_BATCH_SIZE", 10)?;
        if batch_size == 0 {
            return Err(ConfigError::OutOfRange {
                var: "WAYMARK_BATCH_SIZE",
                reason: "must be greater than 0".to_string(),
            });
        }

        let block_timeout_ms: u64 = parse_or(&lookup, "WAYMARK_BLOCK_TIMEOUT_MS", 2000)?;
        if block_timeout_ms == 0 {
            // BLOCK 0 waits forever and shutdown would never be observed.
            return Err(ConfigError::OutOfRange {
                var: "WAYMARK_BLOCK_TIMEOUT_MS",
                reason: "must be greater than 0".to_string(),
            });
        }

        let reclaim_idle_secs: u64 = parse_or(&lookup, "WAYMARK_RECLAIM_IDLE_SECS", 60)?;
        let reclaim_interval_secs: u64 = parse_or(&lookup, "WAYMARK_RECLAIM_INTERVAL_SECS", 15)?;
        let marker_precision: u32 = parse_or(&lookup, "WAYMARK_MARKER_PRECISION", 0)?;

        Ok(Self {
            database_url,
            redis_url,
            status_ttl: Duration::from_secs(status_ttl_secs),
            upload_guard_ttl: Duration::from_secs(upload_guard_ttl_secs),
            worker_group,
            reconciler_group,
            consumer_prefix,
            reconcilers,
            batch_size,
            block_timeout: Duration::from_millis(block_timeout_ms),
            reclaim_min_idle: Duration::from_secs(reclaim_idle_secs),
            reclaim_interval: Duration::from_secs(reclaim_interval_secs),
            marker_precision,
        })
    }
}

fn parse_or<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable could not be parsed.
    #[error("Invalid value for {var}: '{value}'")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
    /// A variable parsed but is outside its allowed range.
    #[error("{var} {reason}")]
    OutOfRange {
        /// Variable name.
        var: &'static str,
        /// Allowed range.
        reason: String,
    },
    /// Workers and reconcilers were configured with the same consumer group.
    #[error("Processing workers and reconcilers must use different consumer groups (both '{0}')")]
    SharedConsumerGroup(String),
}
