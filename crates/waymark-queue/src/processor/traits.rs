// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Image processor trait definitions.
//!
//! Defines the abstract interface between the processing worker and the
//! image transform implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{Dimensions, ProcessJob};

/// Errors from processor operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProcessingError {
    /// The image is invalid and must not be retried.
    #[error("Rejected ({code}): {message}")]
    Rejected {
        /// Machine-readable failure code carried on the result stream.
        code: String,
        /// Human-readable detail for logs.
        message: String,
    },

    /// A dependency failed; the job should be redelivered later.
    #[error("Transient failure: {0}")]
    Transient(String),
}

impl ProcessingError {
    /// Build a rejection.
    pub fn rejected(code: &str, message: impl Into<String>) -> Self {
        Self::Rejected {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Result type for processor operations.
pub type Result<T> = std::result::Result<T, ProcessingError>;

/// The uploaded object as found in storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceObject {
    /// Content type reported by storage.
    pub content_type: String,
    /// Size in bytes.
    pub file_size: u64,
}

/// What analysis learned about the original.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAnalysis {
    /// Original pixel dimensions.
    pub dimensions: Dimensions,
    /// Hex SHA-256 of the original bytes.
    pub sha256: String,
}

/// The processed rendition, before it is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformedImage {
    /// Rendition pixel dimensions.
    pub dimensions: Dimensions,
    /// Rendition content type.
    pub content_type: String,
    /// Rendition size in bytes.
    pub file_size: u64,
}

/// Where the rendition ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    /// ETag returned by storage.
    pub etag: String,
}

/// Trait for image processors.
///
/// One method per pipeline stage; the worker records each stage in the status
/// hash before calling it. Processors do NOT touch the streams or the status
/// hash themselves.
#[async_trait]
pub trait ImageProcessor: Send + Sync {
    /// Processor type identifier (e.g., "mock").
    fn processor_type(&self) -> &'static str;

    /// Locate the uploaded object (stage `validating`).
    async fn inspect(&self, job: &ProcessJob) -> Result<SourceObject>;

    /// Read dimensions and checksum (stage `analyzing`).
    async fn analyze(&self, job: &ProcessJob, source: &SourceObject) -> Result<SourceAnalysis>;

    /// Produce the rendition (stage `transforming`).
    async fn transform(
        &self,
        job: &ProcessJob,
        analysis: &SourceAnalysis,
    ) -> Result<TransformedImage>;

    /// Store the rendition (stage `uploading`).
    async fn store(&self, job: &ProcessJob, image: &TransformedImage) -> Result<StoredObject>;
}
