// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for the image pipeline consumers.
//!
//! [`PipelineRuntime`] spawns the reconciliation consumers on `image:result`
//! and, when an [`ImageProcessor`] is supplied, processing workers on
//! `image:process`. It also owns the [`UploadIntake`] domain services use
//! to enqueue jobs.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use waymark_routes::runtime::PipelineRuntime;
//! use waymark_queue::processor::MockImageProcessor;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!
//!     let runtime = PipelineRuntime::builder()
//!         .pool(pool)
//!         .redis_url("redis://127.0.0.1:6379")
//!         .processor(Arc::new(MockImageProcessor::new()))
//!         .workers(2)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... hand runtime.intake() to a RouteService ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};
use waymark_queue::guard::DEFAULT_GUARD_TTL;
use waymark_queue::keys::{DEFAULT_WORKER_GROUP, PROCESS_STREAM, RESULT_STREAM};
use waymark_queue::processor::ImageProcessor;
use waymark_queue::status::MAX_STATUS_TTL;
use waymark_queue::{
    ConsumerConfig, ProcessingWorker, StatusStore, StreamConsumer, StreamQueue, UploadGuard,
    UploadIntake,
};

use crate::config::{Config, DEFAULT_RECONCILER_GROUP};
use crate::reconciler::ReconciliationConsumer;
use crate::rescale::MarkerRescale;

/// Builder for creating a [`PipelineRuntime`].
pub struct PipelineRuntimeBuilder {
    pool: Option<PgPool>,
    redis_url: String,
    processor: Option<Arc<dyn ImageProcessor>>,
    workers: usize,
    reconcilers: usize,
    worker_group: String,
    reconciler_group: String,
    consumer_prefix: String,
    process_stream: String,
    result_stream: String,
    batch_size: usize,
    block_timeout: Duration,
    reclaim_min_idle: Duration,
    reclaim_interval: Duration,
    status_ttl: Duration,
    upload_guard_ttl: Duration,
    rescale: MarkerRescale,
}

impl Default for PipelineRuntimeBuilder {
    fn default() -> Self {
        let consumer = ConsumerConfig::default();
        Self {
            pool: None,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            processor: None,
            workers: 1,
            reconcilers: 1,
            worker_group: DEFAULT_WORKER_GROUP.to_string(),
            reconciler_group: DEFAULT_RECONCILER_GROUP.to_string(),
            consumer_prefix: format!(
                "waymark-{}",
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            ),
            process_stream: PROCESS_STREAM.to_string(),
            result_stream: RESULT_STREAM.to_string(),
            batch_size: consumer.batch_size,
            block_timeout: consumer.block_timeout,
            reclaim_min_idle: consumer.reclaim_min_idle,
            reclaim_interval: consumer.reclaim_interval,
            status_ttl: MAX_STATUS_TTL,
            upload_guard_ttl: DEFAULT_GUARD_TTL,
            rescale: MarkerRescale::default(),
        }
    }
}

impl PipelineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder preloaded from a [`Config`]. The pool must still be set.
    pub fn from_config(config: &Config) -> Self {
        Self {
            redis_url: config.redis_url.clone(),
            reconcilers: config.reconcilers,
            worker_group: config.worker_group.clone(),
            reconciler_group: config.reconciler_group.clone(),
            consumer_prefix: config.consumer_prefix.clone(),
            batch_size: config.batch_size,
            block_timeout: config.block_timeout,
            reclaim_min_idle: config.reclaim_min_idle,
            reclaim_interval: config.reclaim_interval,
            status_ttl: config.status_ttl,
            upload_guard_ttl: config.upload_guard_ttl,
            rescale: MarkerRescale::new(config.marker_precision),
            ..Self::default()
        }
    }

    /// Set the PostgreSQL connection pool (required).
    pub fn pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Set the Redis URL.
    ///
    /// Default: `redis://127.0.0.1:6379`
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Run processing workers in this process using `processor`.
    ///
    /// Without a processor only reconciliation consumers are started.
    pub fn processor(mut self, processor: Arc<dyn ImageProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Number of processing workers (only used with a processor).
    ///
    /// Default: 1
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = count;
        self
    }

    /// Number of reconciliation consumers.
    ///
    /// Default: 1
    pub fn reconcilers(mut self, count: usize) -> Self {
        self.reconcilers = count;
        self
    }

    /// Consumer group of the processing workers.
    ///
    /// Default: `image-workers`
    pub fn worker_group(mut self, group: impl Into<String>) -> Self {
        self.worker_group = group.into();
        self
    }

    /// Consumer group of the reconciliation consumers.
    ///
    /// Default: `route-reconciler`
    pub fn reconciler_group(mut self, group: impl Into<String>) -> Self {
        self.reconciler_group = group.into();
        self
    }

    /// Prefix of every consumer name started by this runtime.
    pub fn consumer_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.consumer_prefix = prefix.into();
        self
    }

    /// Override the job and result stream names.
    ///
    /// Default: `image:process` and `image:result`
    pub fn streams(mut self, process: impl Into<String>, result: impl Into<String>) -> Self {
        self.process_stream = process.into();
        self.result_stream = result.into();
        self
    }

    /// Entries per read.
    ///
    /// Default: 10
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Upper bound on one blocking read.
    ///
    /// Default: 2 seconds
    pub fn block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    /// Idle time before a pending entry is reclaimed.
    ///
    /// Default: 60 seconds
    pub fn reclaim_min_idle(mut self, idle: Duration) -> Self {
        self.reclaim_min_idle = idle;
        self
    }

    /// How often each consumer sweeps its group's PEL.
    ///
    /// Default: 15 seconds
    pub fn reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    /// TTL of status hashes.
    ///
    /// Default: 1 hour
    pub fn status_ttl(mut self, ttl: Duration) -> Self {
        self.status_ttl = ttl;
        self
    }

    /// TTL of upload guards.
    ///
    /// Default: 15 minutes
    pub fn upload_guard_ttl(mut self, ttl: Duration) -> Self {
        self.upload_guard_ttl = ttl;
        self
    }

    /// Marker rescaling policy.
    pub fn rescale(mut self, rescale: MarkerRescale) -> Self {
        self.rescale = rescale;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing or inconsistent.
    pub fn build(self) -> Result<PipelineRuntimeConfig> {
        let pool = self
            .pool
            .ok_or_else(|| anyhow::anyhow!("pool is required"))?;
        if self.worker_group == self.reconciler_group {
            anyhow::bail!(
                "worker and reconciler groups must differ, both are '{}'",
                self.worker_group
            );
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be greater than 0");
        }
        if self.block_timeout.is_zero() {
            anyhow::bail!("block_timeout must be greater than 0");
        }

        Ok(PipelineRuntimeConfig {
            pool,
            redis_url: self.redis_url,
            processor: self.processor,
            workers: self.workers,
            reconcilers: self.reconcilers,
            worker_group: self.worker_group,
            reconciler_group: self.reconciler_group,
            consumer_prefix: self.consumer_prefix,
            process_stream: self.process_stream,
            result_stream: self.result_stream,
            batch_size: self.batch_size,
            block_timeout: self.block_timeout,
            reclaim_min_idle: self.reclaim_min_idle,
            reclaim_interval: self.reclaim_interval,
            status_ttl: self.status_ttl,
            upload_guard_ttl: self.upload_guard_ttl,
            rescale: self.rescale,
        })
    }
}

/// Configuration for a [`PipelineRuntime`].
pub struct PipelineRuntimeConfig {
    pool: PgPool,
    redis_url: String,
    processor: Option<Arc<dyn ImageProcessor>>,
    workers: usize,
    reconcilers: usize,
    worker_group: String,
    reconciler_group: String,
    consumer_prefix: String,
    process_stream: String,
    result_stream: String,
    batch_size: usize,
    block_timeout: Duration,
    reclaim_min_idle: Duration,
    reclaim_interval: Duration,
    status_ttl: Duration,
    upload_guard_ttl: Duration,
    rescale: MarkerRescale,
}

impl PipelineRuntimeConfig {
    /// Connect to Redis and spawn the consumers.
    pub async fn start(self) -> Result<PipelineRuntime> {
        // Producer side: guard, status and job appends share one connection.
        let producer_conn = waymark_queue::connect(&self.redis_url).await?;
        let intake = UploadIntake::new(
            UploadGuard::new(producer_conn.clone(), self.upload_guard_ttl),
            StatusStore::new(producer_conn.clone(), self.status_ttl),
            StreamQueue::new(producer_conn, &self.process_stream),
        );

        let mut handles = Vec::new();
        let mut shutdowns = Vec::new();

        let reconciler = Arc::new(ReconciliationConsumer::new(self.pool.clone(), self.rescale));
        for index in 0..self.reconcilers {
            // Blocking reads get a dedicated connection per consumer.
            let conn = waymark_queue::connect(&self.redis_url).await?;
            let consumer = StreamConsumer::new(
                StreamQueue::new(conn, &self.result_stream),
                self.consumer_config(&self.reconciler_group, "reconciler", index),
                reconciler.clone(),
            );
            shutdowns.push(consumer.shutdown_handle());
            handles.push(tokio::spawn(consumer.run()));
        }

        let workers = match &self.processor {
            Some(processor) => {
                for index in 0..self.workers {
                    let read_conn = waymark_queue::connect(&self.redis_url).await?;
                    let write_conn = waymark_queue::connect(&self.redis_url).await?;
                    let worker = Arc::new(ProcessingWorker::new(
                        processor.clone(),
                        StatusStore::new(write_conn.clone(), self.status_ttl),
                        StreamQueue::new(write_conn, &self.result_stream),
                    ));
                    let consumer = StreamConsumer::new(
                        StreamQueue::new(read_conn, &self.process_stream),
                        self.consumer_config(&self.worker_group, "worker", index),
                        worker,
                    );
                    shutdowns.push(consumer.shutdown_handle());
                    handles.push(tokio::spawn(consumer.run()));
                }
                info!(
                    processor = processor.processor_type(),
                    workers = self.workers,
                    "Processing workers started"
                );
                self.workers
            }
            None => 0,
        };

        info!(
            reconcilers = self.reconcilers,
            workers,
            reconciler_group = %self.reconciler_group,
            worker_group = %self.worker_group,
            consumer_prefix = %self.consumer_prefix,
            "PipelineRuntime started"
        );

        Ok(PipelineRuntime {
            handles,
            shutdowns,
            intake,
            reconcilers: self.reconcilers,
            workers,
        })
    }

    fn consumer_config(&self, group: &str, role: &str, index: usize) -> ConsumerConfig {
        ConsumerConfig {
            group: group.to_string(),
            consumer: format!("{}-{}-{}", self.consumer_prefix, role, index),
            batch_size: self.batch_size,
            block_timeout: self.block_timeout,
            reclaim_min_idle: self.reclaim_min_idle,
            reclaim_interval: self.reclaim_interval,
            ..ConsumerConfig::default()
        }
    }
}

/// Running pipeline consumers.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct PipelineRuntime {
    handles: Vec<JoinHandle<()>>,
    shutdowns: Vec<Arc<Notify>>,
    intake: UploadIntake,
    reconcilers: usize,
    workers: usize,
}

impl PipelineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> PipelineRuntimeBuilder {
        PipelineRuntimeBuilder::new()
    }

    /// Intake for enqueueing processing jobs.
    pub fn intake(&self) -> &UploadIntake {
        &self.intake
    }

    /// Number of reconciliation consumers running.
    pub fn reconcilers(&self) -> usize {
        self.reconcilers
    }

    /// Number of processing workers running.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Gracefully shut down the runtime.
    ///
    /// Each consumer finishes the entry it is handling, then stops.
    pub async fn shutdown(self) -> Result<()> {
        info!("PipelineRuntime shutting down...");

        for shutdown in &self.shutdowns {
            shutdown.notify_one();
        }

        let mut panicked = 0;
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Consumer task panicked: {}", e);
                panicked += 1;
            }
        }

        if panicked > 0 {
            return Err(anyhow::anyhow!("{} consumer task(s) panicked", panicked));
        }
        info!("PipelineRuntime shutdown complete");
        Ok(())
    }

    /// Check if every consumer is still running.
    pub fn is_running(&self) -> bool {
        self.handles.iter().all(|handle| !handle.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lazy_pool() -> PgPool {
        sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/waymark_test")
            .unwrap()
    }

    #[tokio::test]
    async fn test_build_requires_pool() {
        let err = PipelineRuntime::builder().build().err().unwrap();
        assert!(err.to_string().contains("pool is required"));
    }

    #[tokio::test]
    async fn test_build_rejects_shared_group() {
        let result = PipelineRuntime::builder()
            .pool(lazy_pool())
            .worker_group("same")
            .reconciler_group("same")
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_build_rejects_zero_block_timeout() {
        let result = PipelineRuntime::builder()
            .pool(lazy_pool())
            .block_timeout(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_consumer_names_use_prefix() {
        let config = PipelineRuntime::builder()
            .pool(lazy_pool())
            .consumer_prefix("node-a")
            .batch_size(5)
            .build()
            .unwrap();
        let consumer = config.consumer_config("route-reconciler", "reconciler", 2);
        assert_eq!(consumer.consumer, "node-a-reconciler-2");
        assert_eq!(consumer.group, "route-reconciler");
        assert_eq!(consumer.batch_size, 5);
    }
}
