// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for waymark-routes.

use thiserror::Error;

/// Route domain errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RoutesError {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Image pipeline operation failed.
    #[error("Queue error: {0}")]
    Queue(#[from] waymark_queue::QueueError),

    /// Object storage operation failed.
    #[error("Object store error: {0}")]
    ObjectStore(#[from] crate::object_store::ObjectStoreError),

    /// Route was not found.
    #[error("Route not found: {0}")]
    RouteNotFound(String),

    /// Waypoint was not found on the given route.
    #[error("Waypoint not found: {0}")]
    WaypointNotFound(String),

    /// Image was not found.
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The entity is not in a state that allows the operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// An upload for this image was already accepted.
    #[error("Upload conflict for image {0}")]
    Conflict(String),
}

impl RoutesError {
    /// Whether the error is a caller mistake rather than an infrastructure failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::RouteNotFound(_)
                | Self::WaypointNotFound(_)
                | Self::ImageNotFound(_)
                | Self::InvalidRequest(_)
                | Self::InvalidState(_)
                | Self::Conflict(_)
        )
    }
}

/// Result type using RoutesError.
pub type Result<T> = std::result::Result<T, RoutesError>;
