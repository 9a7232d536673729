// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Consumer-group polling loop shared by every pipeline role.
//!
//! A [`StreamConsumer`] owns one consumer name inside one group. Each
//! iteration it:
//! 1. Sweeps the group's PEL for entries idle longer than `reclaim_min_idle`
//!    (at most once per `reclaim_interval`) and handles them again.
//! 2. Reads up to `batch_size` new entries, blocking for at most
//!    `block_timeout` so shutdown is observed between polls.
//! 3. Hands each entry to the [`EntryHandler`] and acknowledges it only when
//!    the handler answers [`Disposition::Ack`].
//!
//! Retries are never looped inside the consumer: an entry that is not
//! acknowledged stays pending and comes back through the reclaim sweep of
//! whichever consumer reaches it first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::keys::DEFAULT_WORKER_GROUP;
use crate::stream::{StreamEntry, StreamQueue};

/// What to do with an entry after handling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Done (successfully or permanently failed); remove from the PEL.
    Ack,
    /// Leave pending so it is redelivered after the idle threshold.
    Retry,
}

/// Per-entry processing logic plugged into a [`StreamConsumer`].
#[async_trait]
pub trait EntryHandler: Send + Sync {
    /// Role name used in logs.
    fn role(&self) -> &'static str;

    /// Handle one entry. Must be safe to call again for the same entry.
    async fn handle(&self, entry: &StreamEntry) -> Disposition;
}

/// Consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Consumer group name.
    pub group: String,
    /// Consumer name, unique within the group.
    pub consumer: String,
    /// Maximum entries per read or reclaim.
    pub batch_size: usize,
    /// Upper bound on a blocking read.
    pub block_timeout: Duration,
    /// Idle time after which a pending entry may be reclaimed.
    pub reclaim_min_idle: Duration,
    /// How often the PEL is swept.
    pub reclaim_interval: Duration,
    /// Pause after a failed read before polling again.
    pub error_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_WORKER_GROUP.to_string(),
            consumer: format!("consumer-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            batch_size: 10,
            block_timeout: Duration::from_secs(2),
            reclaim_min_idle: Duration::from_secs(60),
            reclaim_interval: Duration::from_secs(15),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Consumer-group loop driving an [`EntryHandler`].
pub struct StreamConsumer<H> {
    queue: StreamQueue,
    config: ConsumerConfig,
    handler: Arc<H>,
    shutdown: Arc<Notify>,
}

impl<H: EntryHandler> StreamConsumer<H> {
    /// Create a consumer reading `queue`.
    pub fn new(queue: StreamQueue, config: ConsumerConfig, handler: Arc<H>) -> Self {
        Self {
            queue,
            config,
            handler,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Consumer configuration.
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Run the consumer loop until shutdown is signalled.
    ///
    /// An entry being handled when shutdown arrives is finished first.
    pub async fn run(self) {
        info!(
            role = self.handler.role(),
            stream = %self.queue.name(),
            group = %self.config.group,
            consumer = %self.config.consumer,
            block_timeout_ms = self.config.block_timeout.as_millis() as u64,
            "Stream consumer started"
        );

        loop {
            match self.queue.ensure_group(&self.config.group).await {
                Ok(()) => break,
                Err(e) => {
                    error!(error = %e, group = %self.config.group, "Failed to create consumer group");
                    if self.backoff().await {
                        info!(role = self.handler.role(), "Stream consumer stopped");
                        return;
                    }
                }
            }
        }

        let mut last_reclaim: Option<Instant> = None;

        loop {
            let reclaim_due = last_reclaim
                .map(|at| at.elapsed() >= self.config.reclaim_interval)
                .unwrap_or(true);
            if reclaim_due {
                last_reclaim = Some(Instant::now());
                if let Err(e) = self.reclaim_once().await {
                    error!(error = %e, role = self.handler.role(), "Failed to reclaim idle entries");
                }
            }

            let batch = tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(role = self.handler.role(), "Stream consumer received shutdown signal");
                    break;
                }

                batch = self.read_batch() => batch,
            };

            match batch {
                Ok(entries) => {
                    self.process(&entries).await;
                }
                Err(e) => {
                    error!(error = %e, role = self.handler.role(), "Failed to read from stream");
                    if self.backoff().await {
                        break;
                    }
                }
            }
        }

        info!(role = self.handler.role(), "Stream consumer stopped");
    }

    /// Read and handle one batch of new entries.
    ///
    /// Returns the number of entries acknowledged.
    pub async fn poll_once(&self) -> Result<usize> {
        let entries = self.read_batch().await?;
        Ok(self.process(&entries).await)
    }

    /// Reclaim idle pending entries for this consumer and handle them.
    ///
    /// Returns the number of entries acknowledged.
    pub async fn reclaim_once(&self) -> Result<usize> {
        let entries = self
            .queue
            .reclaim(
                &self.config.group,
                &self.config.consumer,
                self.config.reclaim_min_idle,
                self.config.batch_size,
            )
            .await?;
        if !entries.is_empty() {
            info!(
                role = self.handler.role(),
                count = entries.len(),
                "Reprocessing reclaimed entries"
            );
        }
        Ok(self.process(&entries).await)
    }

    async fn read_batch(&self) -> Result<Vec<StreamEntry>> {
        self.queue
            .read(
                &self.config.group,
                &self.config.consumer,
                self.config.batch_size,
                self.config.block_timeout,
            )
            .await
    }

    async fn process(&self, entries: &[StreamEntry]) -> usize {
        let mut acked = 0;
        for entry in entries {
            match self.handler.handle(entry).await {
                Disposition::Ack => {
                    match self.queue.ack(&self.config.group, &[entry.id.as_str()]).await {
                        Ok(_) => acked += 1,
                        Err(e) => {
                            // Handled but still pending: it will be redelivered.
                            warn!(entry_id = %entry.id, error = %e, "Failed to acknowledge entry");
                        }
                    }
                }
                Disposition::Retry => {
                    debug!(entry_id = %entry.id, role = self.handler.role(), "Entry left pending for retry");
                }
            }
        }
        acked
    }

    /// Sleep for the error backoff. Returns true if shutdown arrived meanwhile.
    async fn backoff(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.notified() => true,
            _ = tokio::time::sleep(self.config.error_backoff) => false,
        }
    }
}
