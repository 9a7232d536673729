// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job and result messages carried by the pipeline streams.
//!
//! Messages are strictly image-scoped: no route or waypoint identifier ever
//! crosses the stream boundary. Consumers that need domain context resolve it
//! from the image ID on their side.
//!
//! Each message is encoded as flat stream fields (one field per attribute)
//! rather than a JSON payload so entries stay readable with `XRANGE`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};
use crate::stream::StreamEntry;

/// Stored object did not match the expected content type.
pub const INVALID_CONTENT_TYPE: &str = "INVALID_CONTENT_TYPE";
/// Stored object exceeds the job's size limit.
pub const FILE_TOO_LARGE: &str = "FILE_TOO_LARGE";
/// Nothing was uploaded under the storage key.
pub const OBJECT_NOT_FOUND: &str = "OBJECT_NOT_FOUND";
/// The object could not be decoded as an image.
pub const DECODE_FAILED: &str = "DECODE_FAILED";
/// The image has zero width or height.
pub const EMPTY_IMAGE: &str = "EMPTY_IMAGE";

/// Processing stage recorded in the status hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStage {
    /// Job accepted, waiting for a worker.
    Queued,
    /// Checking the uploaded object against the job constraints.
    Validating,
    /// Reading dimensions and checksum.
    Analyzing,
    /// Producing the processed rendition.
    Transforming,
    /// Writing the processed rendition back to storage.
    Uploading,
    /// Processing finished successfully.
    Done,
    /// Processing failed permanently.
    Failed,
}

impl ImageStage {
    /// Stage name as stored in Redis and PostgreSQL.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Validating => "validating",
            Self::Analyzing => "analyzing",
            Self::Transforming => "transforming",
            Self::Uploading => "uploading",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Whether no further stage follows.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for ImageStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageStage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "validating" => Ok(Self::Validating),
            "analyzing" => Ok(Self::Analyzing),
            "transforming" => Ok(Self::Transforming),
            "uploading" => Ok(Self::Uploading),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown image stage '{}'", other)),
        }
    }
}

/// Terminal outcome carried by a result message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    /// The image was processed and stored.
    Processed,
    /// The image was rejected.
    Failed,
}

impl ResultStatus {
    /// Status name as carried on the stream.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for ResultStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown result status '{}'", other)),
        }
    }
}

/// A processing request on `image:process`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessJob {
    /// Image being processed.
    pub image_id: String,
    /// Object-storage key the client uploaded to.
    pub storage_key: String,
    /// Content type the client declared.
    pub expected_content_type: String,
    /// Maximum accepted object size in bytes.
    pub max_file_size: u64,
    /// Token issued with the upload target.
    pub upload_token: String,
    /// When the job was enqueued.
    pub requested_at: DateTime<Utc>,
}

impl ProcessJob {
    /// Encode as stream fields.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("image_id", self.image_id.clone()),
            ("storage_key", self.storage_key.clone()),
            ("expected_content_type", self.expected_content_type.clone()),
            ("max_file_size", self.max_file_size.to_string()),
            ("upload_token", self.upload_token.clone()),
            ("requested_at", self.requested_at.to_rfc3339()),
        ]
    }

    /// Decode from a stream entry.
    pub fn from_entry(entry: &StreamEntry) -> Result<Self> {
        Ok(Self {
            image_id: entry.required("image_id")?.to_string(),
            storage_key: entry.required("storage_key")?.to_string(),
            expected_content_type: entry.required("expected_content_type")?.to_string(),
            max_file_size: entry.parsed("max_file_size")?,
            upload_token: entry.required("upload_token")?.to_string(),
            requested_at: entry.timestamp("requested_at")?,
        })
    }
}

/// Pixel dimensions of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Create dimensions.
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether either axis is zero.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// A terminal outcome on `image:result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessResult {
    /// Image the outcome refers to.
    pub image_id: String,
    /// Processed or failed.
    pub status: ResultStatus,
    /// Hex SHA-256 of the uploaded original.
    pub sha256: Option<String>,
    /// ETag of the stored rendition.
    pub etag: Option<String>,
    /// Size of the stored rendition in bytes.
    pub file_size: Option<u64>,
    /// Content type of the stored rendition.
    pub content_type: Option<String>,
    /// Dimensions of the uploaded original.
    pub original: Option<Dimensions>,
    /// Dimensions of the stored rendition.
    pub processed: Option<Dimensions>,
    /// Failure code for failed outcomes.
    pub error_code: Option<String>,
    /// When processing finished.
    pub processed_at: DateTime<Utc>,
}

impl ProcessResult {
    /// Build a successful outcome.
    #[allow(clippy::too_many_arguments)]
    pub fn processed(
        image_id: impl Into<String>,
        sha256: impl Into<String>,
        etag: impl Into<String>,
        file_size: u64,
        content_type: impl Into<String>,
        original: Dimensions,
        processed: Dimensions,
    ) -> Self {
        Self {
            image_id: image_id.into(),
            status: ResultStatus::Processed,
            sha256: Some(sha256.into()),
            etag: Some(etag.into()),
            file_size: Some(file_size),
            content_type: Some(content_type.into()),
            original: Some(original),
            processed: Some(processed),
            error_code: None,
            processed_at: Utc::now(),
        }
    }

    /// Build a failed outcome.
    pub fn failed(image_id: impl Into<String>, error_code: impl Into<String>) -> Self {
        Self {
            image_id: image_id.into(),
            status: ResultStatus::Failed,
            sha256: None,
            etag: None,
            file_size: None,
            content_type: None,
            original: None,
            processed: None,
            error_code: Some(error_code.into()),
            processed_at: Utc::now(),
        }
    }

    /// Encode as stream fields. Absent optional attributes are omitted.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("image_id", self.image_id.clone()),
            ("status", self.status.as_str().to_string()),
            ("processed_at", self.processed_at.to_rfc3339()),
        ];
        if let Some(ref sha256) = self.sha256 {
            fields.push(("sha256", sha256.clone()));
        }
        if let Some(ref etag) = self.etag {
            fields.push(("etag", etag.clone()));
        }
        if let Some(file_size) = self.file_size {
            fields.push(("file_size", file_size.to_string()));
        }
        if let Some(ref content_type) = self.content_type {
            fields.push(("content_type", content_type.clone()));
        }
        if let Some(original) = self.original {
            fields.push(("original_width", original.width.to_string()));
            fields.push(("original_height", original.height.to_string()));
        }
        if let Some(processed) = self.processed {
            fields.push(("processed_width", processed.width.to_string()));
            fields.push(("processed_height", processed.height.to_string()));
        }
        if let Some(ref code) = self.error_code {
            fields.push(("error_code", code.clone()));
        }
        fields
    }

    /// Decode from a stream entry.
    ///
    /// Processed outcomes must carry checksum, dimensions and content type;
    /// failed outcomes must carry an error code.
    pub fn from_entry(entry: &StreamEntry) -> Result<Self> {
        let status: ResultStatus = entry.parsed("status")?;
        let original = dimensions(entry, "original_width", "original_height")?;
        let processed = dimensions(entry, "processed_width", "processed_height")?;

        let result = Self {
            image_id: entry.required("image_id")?.to_string(),
            status,
            sha256: entry.optional("sha256").map(str::to_string),
            etag: entry.optional("etag").map(str::to_string),
            file_size: entry.optional_parsed("file_size")?,
            content_type: entry.optional("content_type").map(str::to_string),
            original,
            processed,
            error_code: entry.optional("error_code").map(str::to_string),
            processed_at: entry.timestamp("processed_at")?,
        };

        match status {
            ResultStatus::Processed => {
                entry.required("sha256")?;
                entry.required("content_type")?;
                entry.required("original_width")?;
                entry.required("processed_width")?;
            }
            ResultStatus::Failed => {
                entry.required("error_code")?;
            }
        }

        Ok(result)
    }
}

fn dimensions(
    entry: &StreamEntry,
    width_field: &'static str,
    height_field: &'static str,
) -> Result<Option<Dimensions>> {
    let width: Option<u32> = entry.optional_parsed(width_field)?;
    let height: Option<u32> = entry.optional_parsed(height_field)?;
    match (width, height) {
        (Some(width), Some(height)) => Ok(Some(Dimensions { width, height })),
        (None, None) => Ok(None),
        (Some(_), None) => Err(QueueError::MalformedMessage {
            entry_id: entry.id.clone(),
            field: height_field,
            reason: "is missing while width is present".to_string(),
        }),
        (None, Some(_)) => Err(QueueError::MalformedMessage {
            entry_id: entry.id.clone(),
            field: width_field,
            reason: "is missing while height is present".to_string(),
        }),
    }
}
