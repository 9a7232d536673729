// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Producer side of the pipeline.
//!
//! Domain services hand a completed upload to [`UploadIntake::submit`], which
//! takes the upload guard, records the `queued` status and appends the job.

use tracing::{info, warn};

use crate::error::{QueueError, Result};
use crate::guard::UploadGuard;
use crate::message::{ImageStage, ProcessJob};
use crate::status::StatusStore;
use crate::stream::StreamQueue;

/// Entry point used by domain services to enqueue processing jobs.
#[derive(Clone)]
pub struct UploadIntake {
    guard: UploadGuard,
    status: StatusStore,
    jobs: StreamQueue,
}

impl UploadIntake {
    /// Create an intake writing to `jobs`.
    pub fn new(guard: UploadGuard, status: StatusStore, jobs: StreamQueue) -> Self {
        Self {
            guard,
            status,
            jobs,
        }
    }

    /// Status store shared with this intake.
    pub fn status(&self) -> &StatusStore {
        &self.status
    }

    /// Submit a job.
    ///
    /// Returns the stream entry ID, or [`QueueError::Conflict`] if an upload
    /// for the same image was already accepted within the guard window.
    /// Redis failures fail the submission; the guard is never bypassed.
    pub async fn submit(&self, job: &ProcessJob) -> Result<String> {
        if !self.guard.acquire(&job.image_id).await? {
            warn!(image_id = %job.image_id, "Rejecting duplicate upload");
            return Err(QueueError::Conflict {
                image_id: job.image_id.clone(),
            });
        }

        self.status
            .set_stage(&job.image_id, ImageStage::Queued, None)
            .await?;
        let entry_id = self.jobs.publish(&job.to_fields()).await?;

        info!(
            image_id = %job.image_id,
            entry_id = %entry_id,
            stream = %self.jobs.name(),
            "Image job queued"
        );
        Ok(entry_id)
    }
}
