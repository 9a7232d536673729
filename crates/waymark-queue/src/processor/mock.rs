// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock processor for testing.
//!
//! Serves uploads from an in-memory fixture table and "transforms" them with
//! plain fit-within-max-edge arithmetic, without decoding any pixels.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use super::traits::*;
use crate::message::{DECODE_FAILED, Dimensions, EMPTY_IMAGE, OBJECT_NOT_FOUND, ProcessJob};

/// An object a test pretends was uploaded.
#[derive(Debug, Clone)]
pub struct MockUpload {
    /// Content type storage reports.
    pub content_type: String,
    /// Raw bytes (only hashed and measured).
    pub bytes: Vec<u8>,
    /// Pixel dimensions; `None` makes analysis fail with `DECODE_FAILED`.
    pub dimensions: Option<Dimensions>,
}

impl MockUpload {
    /// A decodable upload of `width`x`height` pixels.
    pub fn image(content_type: &str, width: u32, height: u32, bytes: Vec<u8>) -> Self {
        Self {
            content_type: content_type.to_string(),
            bytes,
            dimensions: Some(Dimensions::new(width, height)),
        }
    }
}

/// Mock processor for testing.
pub struct MockImageProcessor {
    uploads: Arc<Mutex<HashMap<String, MockUpload>>>,
    transient_failures: AtomicUsize,
    stored: AtomicUsize,
    /// Longest edge of the rendition.
    pub max_edge: u32,
    /// Content type of the rendition.
    pub output_content_type: String,
}

impl Default for MockImageProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockImageProcessor {
    /// Create a mock processor producing 1920px WebP renditions.
    pub fn new() -> Self {
        Self {
            uploads: Arc::new(Mutex::new(HashMap::new())),
            transient_failures: AtomicUsize::new(0),
            stored: AtomicUsize::new(0),
            max_edge: 1920,
            output_content_type: "image/webp".to_string(),
        }
    }

    /// Register an upload under `storage_key`.
    pub async fn put_upload(&self, storage_key: &str, upload: MockUpload) {
        self.uploads
            .lock()
            .await
            .insert(storage_key.to_string(), upload);
    }

    /// Make the next `count` inspections fail transiently.
    pub fn fail_next(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Number of renditions stored so far.
    pub fn stored_count(&self) -> usize {
        self.stored.load(Ordering::SeqCst)
    }
}

/// Scale `dims` down so its longest edge is at most `max_edge`.
pub fn fit_within(dims: Dimensions, max_edge: u32) -> Dimensions {
    let longest = dims.width.max(dims.height);
    if longest <= max_edge || longest == 0 {
        return dims;
    }
    let scale = max_edge as f64 / longest as f64;
    let scaled = |v: u32| ((v as f64 * scale).round() as u32).max(1);
    Dimensions::new(scaled(dims.width), scaled(dims.height))
}

#[async_trait]
impl ImageProcessor for MockImageProcessor {
    fn processor_type(&self) -> &'static str {
        "mock"
    }

    async fn inspect(&self, job: &ProcessJob) -> Result<SourceObject> {
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ProcessingError::Transient(
                "mock storage unavailable".to_string(),
            ));
        }

        let uploads = self.uploads.lock().await;
        let upload = uploads.get(&job.storage_key).ok_or_else(|| {
            ProcessingError::rejected(
                OBJECT_NOT_FOUND,
                format!("nothing uploaded at '{}'", job.storage_key),
            )
        })?;
        Ok(SourceObject {
            content_type: upload.content_type.clone(),
            file_size: upload.bytes.len() as u64,
        })
    }

    async fn analyze(&self, job: &ProcessJob, _source: &SourceObject) -> Result<SourceAnalysis> {
        let uploads = self.uploads.lock().await;
        let upload = uploads.get(&job.storage_key).ok_or_else(|| {
            ProcessingError::rejected(OBJECT_NOT_FOUND, "upload disappeared during analysis")
        })?;
        let dimensions = upload
            .dimensions
            .ok_or_else(|| ProcessingError::rejected(DECODE_FAILED, "not an image"))?;
        if dimensions.is_empty() {
            return Err(ProcessingError::rejected(
                EMPTY_IMAGE,
                format!("{}x{}", dimensions.width, dimensions.height),
            ));
        }
        Ok(SourceAnalysis {
            dimensions,
            sha256: hex::encode(Sha256::digest(&upload.bytes)),
        })
    }

    async fn transform(
        &self,
        job: &ProcessJob,
        analysis: &SourceAnalysis,
    ) -> Result<TransformedImage> {
        let uploads = self.uploads.lock().await;
        let original_size = uploads
            .get(&job.storage_key)
            .map(|u| u.bytes.len() as u64)
            .unwrap_or(0);

        let dimensions = fit_within(analysis.dimensions, self.max_edge);
        let area_ratio = (dimensions.width as f64 * dimensions.height as f64)
            / (analysis.dimensions.width as f64 * analysis.dimensions.height as f64);
        let file_size = ((original_size as f64 * area_ratio).round() as u64).max(1);

        Ok(TransformedImage {
            dimensions,
            content_type: self.output_content_type.clone(),
            file_size,
        })
    }

    async fn store(&self, job: &ProcessJob, image: &TransformedImage) -> Result<StoredObject> {
        self.stored.fetch_add(1, Ordering::SeqCst);
        let digest = Sha256::digest(
            format!(
                "{}:{}x{}",
                job.storage_key, image.dimensions.width, image.dimensions.height
            )
            .as_bytes(),
        );
        Ok(StoredObject {
            etag: hex::encode(&digest[..16]),
        })
    }
}
