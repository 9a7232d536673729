// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for waymark-queue.

use thiserror::Error;

/// Pipeline errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// Redis operation failed (guard, stream or status store unreachable).
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The upload guard for this image is already held.
    #[error("Upload already in progress or completed for image {image_id}")]
    Conflict {
        /// Image whose guard is held.
        image_id: String,
    },

    /// A stream entry is missing a field or carries an unparsable value.
    #[error("Malformed message in entry {entry_id}: field '{field}' {reason}")]
    MalformedMessage {
        /// Stream entry ID.
        entry_id: String,
        /// Offending field.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// The image processor failed.
    #[error("Processor error: {0}")]
    Processor(#[from] crate::processor::ProcessingError),
}

impl QueueError {
    /// Whether the error came from the Redis connection rather than from the data.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Redis(_))
    }
}

/// Result type using QueueError.
pub type Result<T> = std::result::Result<T, QueueError>;
