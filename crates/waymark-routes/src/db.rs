// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database operations for routes, waypoints and their images.
//!
//! Every write that touches a route's waypoints locks the route row first
//! (`SELECT ... FOR UPDATE`). Reconciliation does the same, so all writers
//! of one route are serialised on that row and never deadlock on each other.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info};

use crate::domain::{
    AccessMethod, LifecycleType, MAX_WAYPOINTS, Marker, RouteStatus, UploadPurpose, Visibility,
    WaypointStatus,
};
use crate::error::{Result, RoutesError};

/// A route.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteRecord {
    /// Unique route ID.
    pub route_id: String,
    /// Owning user.
    pub owner_id: String,
    /// Display title.
    pub title: String,
    /// Lifecycle status.
    pub status: RouteStatus,
    /// Who can see the route.
    pub visibility: Visibility,
    /// How the route is opened.
    pub access_method: AccessMethod,
    /// How long the route lives.
    pub lifecycle_type: LifecycleType,
    /// When the route was created.
    pub created_at: DateTime<Utc>,
    /// When the route was last modified.
    pub updated_at: DateTime<Utc>,
    /// When the last waypoint was confirmed.
    pub ready_at: Option<DateTime<Utc>>,
    /// When the route was published.
    pub published_at: Option<DateTime<Utc>>,
}

/// A waypoint on a route.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaypointRecord {
    /// Unique waypoint ID.
    pub waypoint_id: String,
    /// Owning route.
    pub route_id: String,
    /// Zero-based position, dense and unique per route.
    pub position: i32,
    /// Optional label.
    pub title: Option<String>,
    /// Marker on the current image.
    pub marker: Marker,
    /// Marker style.
    pub marker_type: String,
    /// Pending or confirmed.
    pub status: WaypointStatus,
    /// Image currently shown.
    pub image_id: Option<String>,
    /// Upload in flight (initial or replacement).
    pub pending_image_id: Option<String>,
    /// Marker to apply when a replacement lands.
    pub pending_marker: Option<Marker>,
    /// Failure code of the last failed upload.
    pub error_code: Option<String>,
    /// When the waypoint was first confirmed.
    pub confirmed_at: Option<DateTime<Utc>>,
    /// When the waypoint was last modified.
    pub updated_at: DateTime<Utc>,
}

/// An image row.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ImageRecord {
    /// Unique image ID.
    pub image_id: String,
    /// Processing stage as last reconciled (`queued`, `done` or `failed`).
    pub status: String,
    /// Object-store key of the uploaded original.
    pub storage_key: String,
    /// Content type the client announced.
    pub expected_content_type: String,
    /// Size limit for the upload.
    pub max_file_size: i64,
    /// Token the client presents when completing the upload.
    pub upload_token: String,
    /// Rendition content type.
    pub content_type: Option<String>,
    /// Rendition size in bytes.
    pub file_size: Option<i64>,
    /// Hex SHA-256 of the original.
    pub sha256: Option<String>,
    /// Rendition ETag.
    pub etag: Option<String>,
    /// Original width.
    pub original_width: Option<i32>,
    /// Original height.
    pub original_height: Option<i32>,
    /// Rendition width.
    pub processed_width: Option<i32>,
    /// Rendition height.
    pub processed_height: Option<i32>,
    /// Failure code.
    pub error_code: Option<String>,
    /// When the image row was created.
    pub created_at: DateTime<Utc>,
    /// When the terminal result was reconciled.
    pub processed_at: Option<DateTime<Utc>>,
}

/// Reverse index entry: which waypoint an image belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageOwner {
    /// Image ID.
    pub image_id: String,
    /// Owning route.
    pub route_id: String,
    /// Owning waypoint.
    pub waypoint_id: String,
    /// Why the image was uploaded.
    pub purpose: UploadPurpose,
}

/// Waypoint declaration for [`create_route`].
#[derive(Debug, Clone)]
pub struct NewWaypoint {
    /// Optional label.
    pub title: Option<String>,
    /// Marker against the image that will be uploaded.
    pub marker: Marker,
    /// Marker style.
    pub marker_type: String,
}

/// Route declaration for [`create_route`].
#[derive(Debug, Clone)]
pub struct NewRoute {
    /// Owning user.
    pub owner_id: String,
    /// Display title.
    pub title: String,
    /// Who can see the route.
    pub visibility: Visibility,
    /// How the route is opened.
    pub access_method: AccessMethod,
    /// How long the route lives.
    pub lifecycle_type: LifecycleType,
    /// Waypoints in order; positions are assigned from 0.
    pub waypoints: Vec<NewWaypoint>,
}

/// Image row to create when an upload is scheduled.
#[derive(Debug, Clone)]
pub struct NewUpload {
    /// New image ID.
    pub image_id: String,
    /// Object-store key the client uploads to.
    pub storage_key: String,
    /// Announced content type.
    pub expected_content_type: String,
    /// Size limit.
    pub max_file_size: i64,
    /// Completion token.
    pub upload_token: String,
}

/// What [`delete_route_records`] removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletedRoute {
    /// Waypoints deleted.
    pub waypoints: u64,
    /// Image rows deleted.
    pub images: u64,
    /// Object-store keys of the deleted images.
    pub storage_keys: Vec<String>,
}

/// Create a route and its waypoints in one transaction.
pub async fn create_route(pool: &PgPool, route: &NewRoute) -> Result<RouteRecord> {
    if route.title.trim().is_empty() {
        return Err(RoutesError::InvalidRequest("route title is empty".to_string()));
    }
    if route.waypoints.is_empty() {
        return Err(RoutesError::InvalidRequest(
            "a route needs at least one waypoint".to_string(),
        ));
    }
    if route.waypoints.len() > MAX_WAYPOINTS {
        return Err(RoutesError::InvalidRequest(format!(
            "a route has at most {} waypoints, got {}",
            MAX_WAYPOINTS,
            route.waypoints.len()
        )));
    }
    for (position, waypoint) in route.waypoints.iter().enumerate() {
        waypoint.marker.validate().map_err(|e| {
            RoutesError::InvalidRequest(format!("waypoint {}: {}", position, e))
        })?;
    }

    let route_id = uuid::Uuid::new_v4().to_string();
    let mut tx = pool.begin().await?;

    let row: RouteRow = sqlx::query_as(
        r#"
        INSERT INTO routes (route_id, owner_id, title, status, visibility, access_method, lifecycle_type)
        VALUES ($1, $2, $3, 'preparing', $4, $5, $6)
        RETURNING route_id, owner_id, title, status, visibility, access_method, lifecycle_type,
                  created_at, updated_at, ready_at, published_at
        "#,
    )
    .bind(&route_id)
    .bind(&route.owner_id)
    .bind(&route.title)
    .bind(route.visibility.as_str())
    .bind(route.access_method.as_str())
    .bind(route.lifecycle_type.as_str())
    .fetch_one(&mut *tx)
    .await?;

    for (position, waypoint) in route.waypoints.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO waypoints (waypoint_id, route_id, position, title, marker_x, marker_y, marker_type)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&route_id)
        .bind(position as i32)
        .bind(&waypoint.title)
        .bind(waypoint.marker.x)
        .bind(waypoint.marker.y)
        .bind(&waypoint.marker_type)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    info!(
        route_id = %route_id,
        owner_id = %route.owner_id,
        waypoints = route.waypoints.len(),
        "Route created"
    );

    Ok(row.into())
}

/// Get a route by ID.
pub async fn get_route(pool: &PgPool, route_id: &str) -> Result<Option<RouteRecord>> {
    let row: Option<RouteRow> = sqlx::query_as(
        r#"
        SELECT route_id, owner_id, title, status, visibility, access_method, lifecycle_type,
               created_at, updated_at, ready_at, published_at
        FROM routes
        WHERE route_id = $1
        "#,
    )
    .bind(route_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(Into::into))
}

/// List a route's waypoints in position order.
pub async fn list_waypoints(pool: &PgPool, route_id: &str) -> Result<Vec<WaypointRecord>> {
    let rows: Vec<WaypointRow> = sqlx::query_as(&format!(
        "SELECT {} FROM waypoints WHERE route_id = $1 ORDER BY position",
        WAYPOINT_COLUMNS
    ))
    .bind(route_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

/// Get a waypoint by ID.
pub async fn get_waypoint(pool: &PgPool, waypoint_id: &str) -> Result<Option<WaypointRecord>> {
    let row: Option<WaypointRow> = sqlx::query_as(&format!(
        "SELECT {} FROM waypoints WHERE waypoint_id = $1",
        WAYPOINT_COLUMNS
    ))
    .bind(waypoint_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(Into::into))
}

/// Get an image by ID.
pub async fn get_image(pool: &PgPool, image_id: &str) -> Result<Option<ImageRecord>> {
    let row: Option<ImageRecord> = sqlx::query_as(
        r#"
        SELECT image_id, status, storage_key, expected_content_type, max_file_size, upload_token,
               content_type, file_size, sha256, etag, original_width, original_height,
               processed_width, processed_height, error_code, created_at, processed_at
        FROM images
        WHERE image_id = $1
        "#,
    )
    .bind(image_id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Attach a first image to a pending waypoint.
///
/// Scheduling again before the previous upload was reconciled supersedes it.
pub async fn schedule_upload(
    pool: &PgPool,
    route_id: &str,
    waypoint_id: &str,
    upload: &NewUpload,
) -> Result<()> {
    attach_upload(pool, route_id, waypoint_id, upload, UploadPurpose::Initial, None).await
}

/// Attach a replacement image to a confirmed waypoint.
///
/// `marker` is stored as pending and applied, rescaled, when the
/// replacement is reconciled.
pub async fn request_replacement(
    pool: &PgPool,
    route_id: &str,
    waypoint_id: &str,
    upload: &NewUpload,
    marker: Marker,
) -> Result<()> {
    marker.validate().map_err(RoutesError::InvalidRequest)?;
    attach_upload(
        pool,
        route_id,
        waypoint_id,
        upload,
        UploadPurpose::Replacement,
        Some(marker),
    )
    .await
}

async fn attach_upload(
    pool: &PgPool,
    route_id: &str,
    waypoint_id: &str,
    upload: &NewUpload,
    purpose: UploadPurpose,
    marker: Option<Marker>,
) -> Result<()> {
    let mut tx = pool.begin().await?;

    if lock_route(&mut tx, route_id).await?.is_none() {
        return Err(RoutesError::RouteNotFound(route_id.to_string()));
    }
    let waypoint = lock_waypoint(&mut tx, waypoint_id)
        .await?
        .filter(|w| w.route_id == route_id)
        .ok_or_else(|| RoutesError::WaypointNotFound(waypoint_id.to_string()))?;

    let required = match purpose {
        UploadPurpose::Initial => WaypointStatus::Pending,
        UploadPurpose::Replacement => WaypointStatus::Confirmed,
    };
    if waypoint.status != required {
        return Err(RoutesError::InvalidState(format!(
            "waypoint {} is {}; {} uploads need a {} waypoint",
            waypoint_id, waypoint.status, purpose, required
        )));
    }

    sqlx::query(
        r#"
        INSERT INTO images (image_id, status, storage_key, expected_content_type, max_file_size, upload_token)
        VALUES ($1, 'queued', $2, $3, $4, $5)
        "#,
    )
    .bind(&upload.image_id)
    .bind(&upload.storage_key)
    .bind(&upload.expected_content_type)
    .bind(upload.max_file_size)
    .bind(&upload.upload_token)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO image_owners (image_id, route_id, waypoint_id, purpose) VALUES ($1, $2, $3, $4)",
    )
    .bind(&upload.image_id)
    .bind(route_id)
    .bind(waypoint_id)
    .bind(purpose.as_str())
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE waypoints
        SET pending_image_id = $2,
            pending_marker_x = $3,
            pending_marker_y = $4,
            error_code = NULL,
            updated_at = NOW()
        WHERE waypoint_id = $1
        "#,
    )
    .bind(waypoint_id)
    .bind(&upload.image_id)
    .bind(marker.map(|m| m.x))
    .bind(marker.map(|m| m.y))
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    info!(
        route_id,
        waypoint_id,
        image_id = %upload.image_id,
        purpose = %purpose,
        "Upload scheduled"
    );
    Ok(())
}

/// Set a waypoint's marker directly (explicit metadata update, no rescaling).
pub async fn update_markers(
    pool: &PgPool,
    route_id: &str,
    waypoint_id: &str,
    marker: Marker,
) -> Result<WaypointRecord> {
    marker.validate().map_err(RoutesError::InvalidRequest)?;

    let mut tx = pool.begin().await?;
    if lock_route(&mut tx, route_id).await?.is_none() {
        return Err(RoutesError::RouteNotFound(route_id.to_string()));
    }

    let row: Option<WaypointRow> = sqlx::query_as(&format!(
        r#"
        UPDATE waypoints
        SET marker_x = $3, marker_y = $4, updated_at = NOW()
        WHERE waypoint_id = $1 AND route_id = $2
        RETURNING {}
        "#,
        WAYPOINT_COLUMNS
    ))
    .bind(waypoint_id)
    .bind(route_id)
    .bind(marker.x)
    .bind(marker.y)
    .fetch_optional(&mut *tx)
    .await?;

    let row = row.ok_or_else(|| RoutesError::WaypointNotFound(waypoint_id.to_string()))?;
    tx.commit().await?;

    debug!(route_id, waypoint_id, "Waypoint markers updated");
    Ok(row.into())
}

/// Publish a ready route.
///
/// Publishing an already published route returns it unchanged.
pub async fn publish_route(pool: &PgPool, route_id: &str) -> Result<RouteRecord> {
    let row: Option<RouteRow> = sqlx::query_as(
        r#"
        UPDATE routes
        SET status = 'published', published_at = NOW(), updated_at = NOW()
        WHERE route_id = $1 AND status = 'ready'
        RETURNING route_id, owner_id, title, status, visibility, access_method, lifecycle_type,
                  created_at, updated_at, ready_at, published_at
        "#,
    )
    .bind(route_id)
    .fetch_optional(pool)
    .await?;

    if let Some(row) = row {
        info!(route_id, "Route published");
        return Ok(row.into());
    }

    match get_route(pool, route_id).await? {
        None => Err(RoutesError::RouteNotFound(route_id.to_string())),
        Some(route) if route.status == RouteStatus::Published => Ok(route),
        Some(route) => Err(RoutesError::InvalidState(format!(
            "route {} is {}; only ready routes can be published",
            route_id, route.status
        ))),
    }
}

/// Look up which waypoint and route own an image.
pub async fn resolve_image_owner(pool: &PgPool, image_id: &str) -> Result<Option<ImageOwner>> {
    let row: Option<(String, String, String, String)> = sqlx::query_as(
        "SELECT image_id, route_id, waypoint_id, purpose FROM image_owners WHERE image_id = $1",
    )
    .bind(image_id)
    .fetch_optional(pool)
    .await?;

    row.map(|(image_id, route_id, waypoint_id, purpose)| -> Result<ImageOwner> {
        let purpose = purpose.parse().map_err(RoutesError::InvalidState)?;
        Ok(ImageOwner {
            image_id,
            route_id,
            waypoint_id,
            purpose,
        })
    })
    .transpose()
}

/// Delete a route with its waypoints and images.
///
/// Returns the storage keys of every image ever attached to the route so
/// the caller can remove the objects.
pub async fn delete_route_records(pool: &PgPool, route_id: &str) -> Result<DeletedRoute> {
    let mut tx = pool.begin().await?;

    if lock_route(&mut tx, route_id).await?.is_none() {
        return Err(RoutesError::RouteNotFound(route_id.to_string()));
    }

    let images: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT i.image_id, i.storage_key
        FROM images i
        JOIN image_owners o ON o.image_id = i.image_id
        WHERE o.route_id = $1
        "#,
    )
    .bind(route_id)
    .fetch_all(&mut *tx)
    .await?;
    let (image_ids, storage_keys): (Vec<String>, Vec<String>) = images.into_iter().unzip();

    let waypoints = sqlx::query("DELETE FROM waypoints WHERE route_id = $1")
        .bind(route_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    let images = sqlx::query("DELETE FROM images WHERE image_id = ANY($1)")
        .bind(&image_ids)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    sqlx::query("DELETE FROM routes WHERE route_id = $1")
        .bind(route_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    info!(route_id, waypoints, images, "Route records deleted");
    Ok(DeletedRoute {
        waypoints,
        images,
        storage_keys,
    })
}

/// Lock a route row for the rest of the transaction and return its status.
pub(crate) async fn lock_route(
    conn: &mut PgConnection,
    route_id: &str,
) -> Result<Option<RouteStatus>> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM routes WHERE route_id = $1 FOR UPDATE")
            .bind(route_id)
            .fetch_optional(&mut *conn)
            .await?;

    status
        .map(|s| s.parse().map_err(RoutesError::InvalidState))
        .transpose()
}

/// Lock a waypoint row for the rest of the transaction.
pub(crate) async fn lock_waypoint(
    conn: &mut PgConnection,
    waypoint_id: &str,
) -> Result<Option<WaypointRecord>> {
    let row: Option<WaypointRow> = sqlx::query_as(&format!(
        "SELECT {} FROM waypoints WHERE waypoint_id = $1 FOR UPDATE",
        WAYPOINT_COLUMNS
    ))
    .bind(waypoint_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(Into::into))
}

const WAYPOINT_COLUMNS: &str = "waypoint_id, route_id, position, title, marker_x, marker_y, \
     marker_type, status, image_id, pending_image_id, pending_marker_x, pending_marker_y, \
     error_code, confirmed_at, updated_at";

/// Internal row type for route queries
#[derive(sqlx::FromRow)]
struct RouteRow {
    route_id: String,
    owner_id: String,
    title: String,
    status: String,
    visibility: String,
    access_method: String,
    lifecycle_type: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    ready_at: Option<DateTime<Utc>>,
    published_at: Option<DateTime<Utc>>,
}

impl From<RouteRow> for RouteRecord {
    fn from(row: RouteRow) -> Self {
        // CHECK constraints restrict these columns to known values.
        RouteRecord {
            route_id: row.route_id,
            owner_id: row.owner_id,
            title: row.title,
            status: row.status.parse().unwrap_or(RouteStatus::Preparing),
            visibility: row.visibility.parse().unwrap_or_default(),
            access_method: row.access_method.parse().unwrap_or_default(),
            lifecycle_type: row.lifecycle_type.parse().unwrap_or_default(),
            created_at: row.created_at,
            updated_at: row.updated_at,
            ready_at: row.ready_at,
            published_at: row.published_at,
        }
    }
}

/// Internal row type for waypoint queries
#[derive(sqlx::FromRow)]
struct WaypointRow {
    waypoint_id: String,
    route_id: String,
    position: i32,
    title: Option<String>,
    marker_x: f64,
    marker_y: f64,
    marker_type: String,
    status: String,
    image_id: Option<String>,
    pending_image_id: Option<String>,
    pending_marker_x: Option<f64>,
    pending_marker_y: Option<f64>,
    error_code: Option<String>,
    confirmed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl From<WaypointRow> for WaypointRecord {
    fn from(row: WaypointRow) -> Self {
        let pending_marker = match (row.pending_marker_x, row.pending_marker_y) {
            (Some(x), Some(y)) => Some(Marker::new(x, y)),
            _ => None,
        };
        WaypointRecord {
            waypoint_id: row.waypoint_id,
            route_id: row.route_id,
            position: row.position,
            title: row.title,
            marker: Marker::new(row.marker_x, row.marker_y),
            marker_type: row.marker_type,
            status: row.status.parse().unwrap_or(WaypointStatus::Pending),
            image_id: row.image_id,
            pending_image_id: row.pending_image_id,
            pending_marker,
            error_code: row.error_code,
            confirmed_at: row.confirmed_at,
            updated_at: row.updated_at,
        }
    }
}
