// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Route service: the in-process API an HTTP layer calls.
//!
//! Upload flow for one waypoint:
//!
//! ```text
//!  schedule_upload ─► client PUTs to storage_key ─► complete_upload
//!        │                                              │
//!   images row (queued)                      guard + status + image:process
//!   image_owners row
//! ```
//!
//! Reconciliation happens asynchronously in the
//! [`ReconciliationConsumer`](crate::reconciler::ReconciliationConsumer).

use std::sync::Arc;

use serde::Serialize;
use sqlx::PgPool;
use tracing::{info, warn};
use waymark_queue::{ImageStatus, ProcessJob, QueueError, UploadIntake};

use crate::db::{self, NewRoute, NewUpload, RouteRecord, WaypointRecord};
use crate::domain::{self, Marker};
use crate::error::{Result, RoutesError};
use crate::object_store::ObjectStore;

/// Default upload size limit (25 MiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 25 * 1024 * 1024;

/// Upload limits and storage layout.
#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// Maximum accepted object size in bytes.
    pub max_file_size: u64,
    /// Prefix prepended to every storage key.
    pub storage_prefix: String,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            storage_prefix: "routes".to_string(),
        }
    }
}

/// Where and how the client uploads an image.
#[derive(Debug, Clone, Serialize)]
pub struct UploadTicket {
    /// Image ID allocated for the upload.
    pub image_id: String,
    /// Object key the client uploads to.
    pub storage_key: String,
    /// Token the client presents when completing the upload.
    pub upload_token: String,
    /// Content type the object must have.
    pub expected_content_type: String,
    /// Maximum object size in bytes.
    pub max_file_size: u64,
}

/// A route with its waypoints.
#[derive(Debug, Clone, Serialize)]
pub struct RouteSnapshot {
    /// The route.
    pub route: RouteRecord,
    /// Waypoints ordered by position.
    pub waypoints: Vec<WaypointRecord>,
}

/// What deleting a route removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeletionSummary {
    /// Waypoint rows deleted.
    pub waypoints: u64,
    /// Image rows deleted.
    pub images: u64,
    /// Stored objects deleted.
    pub objects: u64,
}

/// Route and upload operations.
#[derive(Clone)]
pub struct RouteService {
    pool: PgPool,
    intake: UploadIntake,
    objects: Arc<dyn ObjectStore>,
    settings: UploadSettings,
}

impl RouteService {
    /// Create a service.
    pub fn new(
        pool: PgPool,
        intake: UploadIntake,
        objects: Arc<dyn ObjectStore>,
        settings: UploadSettings,
    ) -> Self {
        Self {
            pool,
            intake,
            objects,
            settings,
        }
    }

    /// Upload settings.
    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    /// Create a route in `preparing` with all waypoints `pending`.
    pub async fn create_route(&self, route: &NewRoute) -> Result<RouteSnapshot> {
        let record = db::create_route(&self.pool, route).await?;
        let waypoints = db::list_waypoints(&self.pool, &record.route_id).await?;
        Ok(RouteSnapshot {
            route: record,
            waypoints,
        })
    }

    /// Allocate an upload target for a pending waypoint's first image.
    pub async fn schedule_upload(
        &self,
        route_id: &str,
        waypoint_id: &str,
        content_type: &str,
    ) -> Result<UploadTicket> {
        let (ticket, upload) = self.new_ticket(route_id, waypoint_id, content_type)?;
        db::schedule_upload(&self.pool, route_id, waypoint_id, &upload).await?;
        Ok(ticket)
    }

    /// Allocate an upload target replacing a confirmed waypoint's image.
    ///
    /// `marker` is placed against the new original and rescaled on reconcile.
    pub async fn request_replacement(
        &self,
        route_id: &str,
        waypoint_id: &str,
        content_type: &str,
        marker: Marker,
    ) -> Result<UploadTicket> {
        let (ticket, upload) = self.new_ticket(route_id, waypoint_id, content_type)?;
        db::request_replacement(&self.pool, route_id, waypoint_id, &upload, marker).await?;
        Ok(ticket)
    }

    /// Hand a finished upload to the processing pipeline.
    ///
    /// Returns the `image:process` entry ID. A second completion of the same
    /// image within the guard window is [`RoutesError::Conflict`].
    pub async fn complete_upload(&self, image_id: &str, upload_token: &str) -> Result<String> {
        let image = db::get_image(&self.pool, image_id)
            .await?
            .ok_or_else(|| RoutesError::ImageNotFound(image_id.to_string()))?;

        if image.upload_token != upload_token {
            return Err(RoutesError::InvalidRequest(format!(
                "upload token does not match image {}",
                image_id
            )));
        }
        if image.status != waymark_queue::ImageStage::Queued.as_str() {
            return Err(RoutesError::InvalidState(format!(
                "image {} is already {}",
                image_id, image.status
            )));
        }

        let job = ProcessJob {
            image_id: image.image_id.clone(),
            storage_key: image.storage_key.clone(),
            expected_content_type: image.expected_content_type.clone(),
            max_file_size: image.max_file_size.max(0) as u64,
            upload_token: image.upload_token.clone(),
            requested_at: chrono::Utc::now(),
        };

        match self.intake.submit(&job).await {
            Ok(entry_id) => Ok(entry_id),
            Err(QueueError::Conflict { image_id }) => Err(RoutesError::Conflict(image_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Current pipeline status of an image, if still retained.
    pub async fn upload_status(&self, image_id: &str) -> Result<Option<ImageStatus>> {
        Ok(self.intake.status().get(image_id).await?)
    }

    /// Set a waypoint's marker directly.
    pub async fn update_markers(
        &self,
        route_id: &str,
        waypoint_id: &str,
        marker: Marker,
    ) -> Result<WaypointRecord> {
        db::update_markers(&self.pool, route_id, waypoint_id, marker).await
    }

    /// Publish a `ready` route.
    pub async fn publish_route(&self, route_id: &str) -> Result<RouteRecord> {
        db::publish_route(&self.pool, route_id).await
    }

    /// Delete a route, its waypoints, images and stored objects.
    ///
    /// Rows are removed first. Object deletion failures are logged and
    /// reported as zero objects; the route stays deleted.
    pub async fn delete_route(&self, route_id: &str) -> Result<DeletionSummary> {
        let deleted = db::delete_route_records(&self.pool, route_id).await?;

        let objects = if deleted.storage_keys.is_empty() {
            0
        } else {
            match self.objects.delete_objects(&deleted.storage_keys).await {
                Ok(count) => count,
                Err(e) => {
                    warn!(
                        route_id,
                        store = self.objects.store_type(),
                        keys = deleted.storage_keys.len(),
                        error = %e,
                        "Failed to delete stored objects for route"
                    );
                    0
                }
            }
        };

        let summary = DeletionSummary {
            waypoints: deleted.waypoints,
            images: deleted.images,
            objects,
        };
        info!(
            route_id,
            waypoints = summary.waypoints,
            images = summary.images,
            objects = summary.objects,
            "Route deleted"
        );
        Ok(summary)
    }

    /// Load a route with its waypoints.
    pub async fn route_snapshot(&self, route_id: &str) -> Result<RouteSnapshot> {
        let route = db::get_route(&self.pool, route_id)
            .await?
            .ok_or_else(|| RoutesError::RouteNotFound(route_id.to_string()))?;
        let waypoints = db::list_waypoints(&self.pool, route_id).await?;
        Ok(RouteSnapshot { route, waypoints })
    }

    fn new_ticket(
        &self,
        route_id: &str,
        waypoint_id: &str,
        content_type: &str,
    ) -> Result<(UploadTicket, NewUpload)> {
        let content_type = content_type.trim().to_ascii_lowercase();
        if !domain::is_allowed_content_type(&content_type) {
            return Err(RoutesError::InvalidRequest(format!(
                "unsupported content type: {}",
                content_type
            )));
        }

        let image_id = uuid::Uuid::new_v4().to_string();
        let ticket = UploadTicket {
            storage_key: storage_key(&self.settings.storage_prefix, route_id, waypoint_id, &image_id),
            upload_token: uuid::Uuid::new_v4().simple().to_string(),
            expected_content_type: content_type,
            max_file_size: self.settings.max_file_size,
            image_id,
        };
        let upload = NewUpload {
            image_id: ticket.image_id.clone(),
            storage_key: ticket.storage_key.clone(),
            expected_content_type: ticket.expected_content_type.clone(),
            max_file_size: i64::try_from(ticket.max_file_size).unwrap_or(i64::MAX),
            upload_token: ticket.upload_token.clone(),
        };
        Ok((ticket, upload))
    }
}

/// Object key for an uploaded original.
pub fn storage_key(prefix: &str, route_id: &str, waypoint_id: &str, image_id: &str) -> String {
    format!(
        "{}/{}/waypoints/{}/{}",
        prefix.trim_end_matches('/'),
        route_id,
        waypoint_id,
        image_id
    )
}
