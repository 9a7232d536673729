// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciliation consumer: applies `image:result` entries to routes.
//!
//! Result messages carry no route or waypoint IDs. Each one is resolved
//! through `image_owners` before the reconciliation transaction runs. The
//! entry is acknowledged only after that transaction committed; a database
//! error leaves it pending so the reclaim sweep retries it.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{error, info, warn};
use waymark_queue::{Disposition, EntryHandler, ProcessResult, ResultStatus, StreamEntry};

use crate::db;
use crate::reconcile::{self, ReconcileOutcome};
use crate::rescale::MarkerRescale;

/// Handler for result entries.
pub struct ReconciliationConsumer {
    pool: PgPool,
    rescale: MarkerRescale,
}

impl ReconciliationConsumer {
    /// Create a consumer reconciling into `pool`.
    pub fn new(pool: PgPool, rescale: MarkerRescale) -> Self {
        Self { pool, rescale }
    }

    /// Resolve and apply one decoded result.
    pub async fn apply(&self, result: &ProcessResult) -> crate::error::Result<ReconcileOutcome> {
        let Some(owner) = db::resolve_image_owner(&self.pool, &result.image_id).await? else {
            return Ok(ReconcileOutcome::OwnerMissing);
        };

        match result.status {
            ResultStatus::Processed => {
                reconcile::reconcile_processed(&self.pool, &owner, result, &self.rescale).await
            }
            ResultStatus::Failed => reconcile::record_failure(&self.pool, &owner, result).await,
        }
    }
}

#[async_trait]
impl EntryHandler for ReconciliationConsumer {
    fn role(&self) -> &'static str {
        "route-reconciler"
    }

    async fn handle(&self, entry: &StreamEntry) -> Disposition {
        let result = match ProcessResult::from_entry(entry) {
            Ok(result) => result,
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "Dropping malformed result");
                return Disposition::Ack;
            }
        };

        match self.apply(&result).await {
            Ok(ReconcileOutcome::OwnerMissing) => {
                warn!(
                    image_id = %result.image_id,
                    entry_id = %entry.id,
                    "No owning waypoint for image; acknowledging"
                );
                Disposition::Ack
            }
            Ok(outcome) => {
                info!(
                    image_id = %result.image_id,
                    entry_id = %entry.id,
                    outcome = ?outcome,
                    "Result reconciled"
                );
                Disposition::Ack
            }
            Err(e) if e.is_client_error() => {
                warn!(image_id = %result.image_id, error = %e, "Result cannot be applied; acknowledging");
                Disposition::Ack
            }
            Err(e) => {
                error!(image_id = %result.image_id, error = %e, "Reconciliation failed; leaving result pending");
                Disposition::Retry
            }
        }
    }
}
