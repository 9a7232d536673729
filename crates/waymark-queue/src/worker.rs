// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Processing worker: consumes `image:process`, publishes `image:result`.
//!
//! ```text
//!  queued ─► validating ─► analyzing ─► transforming ─► uploading ─► done
//!                │              │              │              │
//!                └──────────────┴──── rejected ┴──────────────┴──► failed
//! ```
//!
//! Every stage is written to the status hash before the processor runs it.
//! The terminal result is published before the job is acknowledged, so a
//! crash between the two only causes a duplicate result, never a lost one.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::consumer::{Disposition, EntryHandler};
use crate::error::{QueueError, Result};
use crate::message::{
    FILE_TOO_LARGE, INVALID_CONTENT_TYPE, ImageStage, ProcessJob, ProcessResult,
};
use crate::processor::{ImageProcessor, ProcessingError, SourceObject};
use crate::status::StatusStore;
use crate::stream::{StreamEntry, StreamQueue};

/// Handler for processing jobs.
pub struct ProcessingWorker {
    processor: Arc<dyn ImageProcessor>,
    status: StatusStore,
    results: StreamQueue,
}

impl ProcessingWorker {
    /// Create a worker publishing outcomes to `results`.
    pub fn new(
        processor: Arc<dyn ImageProcessor>,
        status: StatusStore,
        results: StreamQueue,
    ) -> Self {
        Self {
            processor,
            status,
            results,
        }
    }

    async fn run_stages(&self, job: &ProcessJob) -> Result<ProcessResult> {
        self.stage(job, ImageStage::Validating).await?;
        let source = self.processor.inspect(job).await?;
        validate_source(job, &source)?;

        self.stage(job, ImageStage::Analyzing).await?;
        let analysis = self.processor.analyze(job, &source).await?;

        self.stage(job, ImageStage::Transforming).await?;
        let image = self.processor.transform(job, &analysis).await?;

        self.stage(job, ImageStage::Uploading).await?;
        let stored = self.processor.store(job, &image).await?;

        Ok(ProcessResult::processed(
            &job.image_id,
            analysis.sha256,
            stored.etag,
            image.file_size,
            image.content_type,
            analysis.dimensions,
            image.dimensions,
        ))
    }

    async fn stage(&self, job: &ProcessJob, stage: ImageStage) -> Result<()> {
        self.status.set_stage(&job.image_id, stage, None).await
    }

    async fn finish(
        &self,
        job: &ProcessJob,
        result: &ProcessResult,
        stage: ImageStage,
    ) -> Disposition {
        if let Err(e) = self.results.publish(&result.to_fields()).await {
            error!(image_id = %job.image_id, error = %e, "Failed to publish result");
            return Disposition::Retry;
        }
        if let Err(e) = self
            .status
            .set_stage(&job.image_id, stage, result.error_code.as_deref())
            .await
        {
            warn!(image_id = %job.image_id, error = %e, "Result published but status write failed");
        }
        Disposition::Ack
    }
}

/// Check the stored object against the job's declared constraints.
pub fn validate_source(
    job: &ProcessJob,
    source: &SourceObject,
) -> std::result::Result<(), ProcessingError> {
    if !same_media_type(&source.content_type, &job.expected_content_type) {
        return Err(ProcessingError::rejected(
            INVALID_CONTENT_TYPE,
            format!(
                "expected '{}', found '{}'",
                job.expected_content_type, source.content_type
            ),
        ));
    }
    if source.file_size > job.max_file_size {
        return Err(ProcessingError::rejected(
            FILE_TOO_LARGE,
            format!("{} bytes exceeds {}", source.file_size, job.max_file_size),
        ));
    }
    Ok(())
}

fn same_media_type(a: &str, b: &str) -> bool {
    let essence = |s: &str| s.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    essence(a) == essence(b)
}

#[async_trait]
impl EntryHandler for ProcessingWorker {
    fn role(&self) -> &'static str {
        "processing-worker"
    }

    async fn handle(&self, entry: &StreamEntry) -> Disposition {
        let job = match ProcessJob::from_entry(entry) {
            Ok(job) => job,
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "Dropping malformed job");
                return Disposition::Ack;
            }
        };

        match self.run_stages(&job).await {
            Ok(result) => {
                info!(
                    image_id = %job.image_id,
                    processor = self.processor.processor_type(),
                    "Image processed"
                );
                self.finish(&job, &result, ImageStage::Done).await
            }
            Err(QueueError::Processor(ProcessingError::Rejected { code, message })) => {
                warn!(image_id = %job.image_id, code = %code, message = %message, "Image rejected");
                let result = ProcessResult::failed(&job.image_id, code);
                self.finish(&job, &result, ImageStage::Failed).await
            }
            Err(e) => {
                warn!(image_id = %job.image_id, error = %e, "Processing interrupted, leaving job pending");
                Disposition::Retry
            }
        }
    }
}
