// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transactional reconciliation of processing results.
//!
//! Each terminal result is applied in a single transaction:
//!
//! ```text
//!  lock route ─► lock image ─► already terminal? ──yes──► AlreadyApplied
//!                                   │ no
//!                                   ▼
//!                          store image attributes
//!                                   │
//!                 waypoint still waiting for this image? ──no──► Superseded
//!                                   │ yes
//!                                   ▼
//!             rescale markers, swap image, confirm waypoint
//!                                   │
//!               count pending waypoints ─► 0: preparing → ready
//! ```
//!
//! The route row lock serialises every reconciliation of one route. The
//! transaction runs under READ COMMITTED, so after the lock is granted the
//! pending count sees every sibling confirmation that committed before it.
//! Auto-activation therefore happens exactly once, in the transaction that
//! confirms the last pending waypoint.

use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tracing::{debug, info};
use waymark_queue::{Dimensions, ImageStage, ProcessResult};

use crate::db::{self, ImageOwner};
use crate::domain::{Marker, RouteStatus, UploadPurpose, WaypointStatus};
use crate::error::{Result, RoutesError};
use crate::rescale::MarkerRescale;

/// What reconciling one result did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A pending waypoint was confirmed.
    Confirmed {
        /// Whether this confirmation moved the route to `ready`.
        route_activated: bool,
    },
    /// A confirmed waypoint's image and markers were swapped.
    Replaced,
    /// The result was reconciled before (redelivery).
    AlreadyApplied,
    /// A newer upload was scheduled for the waypoint; only the image row was updated.
    Superseded,
    /// The failure was recorded on the image and waypoint.
    Failed,
    /// The route or waypoint no longer exists.
    OwnerMissing,
}

/// Apply a `processed` result.
pub async fn reconcile_processed(
    pool: &PgPool,
    owner: &ImageOwner,
    result: &ProcessResult,
    rescale: &MarkerRescale,
) -> Result<ReconcileOutcome> {
    let attributes = ImageAttributes::from_result(result)?;
    let mut tx = begin(pool).await?;

    if db::lock_route(&mut tx, &owner.route_id).await?.is_none() {
        return Ok(ReconcileOutcome::OwnerMissing);
    }
    match lock_image_status(&mut tx, &owner.image_id).await? {
        None => return Ok(ReconcileOutcome::OwnerMissing),
        Some(stage) if stage.is_terminal() => {
            debug!(image_id = %owner.image_id, stage = %stage, "Result already reconciled");
            return Ok(ReconcileOutcome::AlreadyApplied);
        }
        Some(_) => {}
    }
    let Some(waypoint) = db::lock_waypoint(&mut tx, &owner.waypoint_id).await? else {
        return Ok(ReconcileOutcome::OwnerMissing);
    };

    store_processed_image(&mut tx, result, &attributes).await?;

    if waypoint.pending_image_id.as_deref() != Some(owner.image_id.as_str()) {
        tx.commit().await?;
        info!(
            image_id = %owner.image_id,
            waypoint_id = %owner.waypoint_id,
            "Processed image superseded by a newer upload"
        );
        return Ok(ReconcileOutcome::Superseded);
    }

    let placed = match owner.purpose {
        UploadPurpose::Initial => waypoint.marker,
        UploadPurpose::Replacement => waypoint.pending_marker.unwrap_or(waypoint.marker),
    };
    let marker = rescale.rescale(placed, result.original, result.processed);
    confirm_waypoint(&mut tx, &owner.waypoint_id, &owner.image_id, marker).await?;

    let outcome = if waypoint.status == WaypointStatus::Pending {
        let remaining = count_pending_waypoints(&mut tx, &owner.route_id).await?;
        let route_activated = remaining == 0 && activate_route(&mut tx, &owner.route_id).await?;
        ReconcileOutcome::Confirmed { route_activated }
    } else {
        ReconcileOutcome::Replaced
    };

    tx.commit().await?;

    info!(
        image_id = %owner.image_id,
        route_id = %owner.route_id,
        waypoint_id = %owner.waypoint_id,
        outcome = ?outcome,
        marker_x = marker.x,
        marker_y = marker.y,
        "Processed image reconciled"
    );
    Ok(outcome)
}

/// Apply a `failed` result. Route status is never changed.
pub async fn record_failure(
    pool: &PgPool,
    owner: &ImageOwner,
    result: &ProcessResult,
) -> Result<ReconcileOutcome> {
    let error_code = result.error_code.as_deref().ok_or_else(|| {
        RoutesError::InvalidRequest(format!("failed result for {} has no error code", result.image_id))
    })?;

    let mut tx = begin(pool).await?;

    if db::lock_route(&mut tx, &owner.route_id).await?.is_none() {
        return Ok(ReconcileOutcome::OwnerMissing);
    }
    match lock_image_status(&mut tx, &owner.image_id).await? {
        None => return Ok(ReconcileOutcome::OwnerMissing),
        Some(stage) if stage.is_terminal() => return Ok(ReconcileOutcome::AlreadyApplied),
        Some(_) => {}
    }
    let Some(waypoint) = db::lock_waypoint(&mut tx, &owner.waypoint_id).await? else {
        return Ok(ReconcileOutcome::OwnerMissing);
    };

    sqlx::query(
        r#"
        UPDATE images
        SET status = 'failed', error_code = $2, processed_at = $3, updated_at = NOW()
        WHERE image_id = $1
        "#,
    )
    .bind(&owner.image_id)
    .bind(error_code)
    .bind(result.processed_at)
    .execute(&mut *tx)
    .await?;

    if waypoint.pending_image_id.as_deref() != Some(owner.image_id.as_str()) {
        tx.commit().await?;
        return Ok(ReconcileOutcome::Superseded);
    }

    // Clearing the pending upload lets the client schedule a new one.
    sqlx::query(
        r#"
        UPDATE waypoints
        SET error_code = $2,
            pending_image_id = NULL,
            pending_marker_x = NULL,
            pending_marker_y = NULL,
            updated_at = NOW()
        WHERE waypoint_id = $1
        "#,
    )
    .bind(&owner.waypoint_id)
    .bind(error_code)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    info!(
        image_id = %owner.image_id,
        waypoint_id = %owner.waypoint_id,
        error_code,
        "Image failure recorded"
    );
    Ok(ReconcileOutcome::Failed)
}

/// Open a transaction with an explicit READ COMMITTED isolation level.
///
/// Under REPEATABLE READ the snapshot taken before the route lock was
/// granted would hide sibling confirmations from the pending count.
async fn begin(pool: &PgPool) -> Result<Transaction<'static, Postgres>> {
    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

async fn lock_image_status(conn: &mut PgConnection, image_id: &str) -> Result<Option<ImageStage>> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM images WHERE image_id = $1 FOR UPDATE")
            .bind(image_id)
            .fetch_optional(&mut *conn)
            .await?;

    status
        .map(|s| s.parse().map_err(RoutesError::InvalidState))
        .transpose()
}

/// Numeric image attributes converted to their column types.
#[derive(Debug, Default, PartialEq, Eq)]
struct ImageAttributes {
    file_size: Option<i64>,
    original: Option<(i32, i32)>,
    processed: Option<(i32, i32)>,
}

impl ImageAttributes {
    fn from_result(result: &ProcessResult) -> Result<Self> {
        let file_size = result
            .file_size
            .map(|size| {
                i64::try_from(size).map_err(|_| {
                    RoutesError::InvalidRequest(format!(
                        "file size {} of image {} is out of range",
                        size, result.image_id
                    ))
                })
            })
            .transpose()?;
        Ok(Self {
            file_size,
            original: column_dimensions(result.original, &result.image_id)?,
            processed: column_dimensions(result.processed, &result.image_id)?,
        })
    }
}

fn column_dimensions(dims: Option<Dimensions>, image_id: &str) -> Result<Option<(i32, i32)>> {
    let Some(d) = dims else {
        return Ok(None);
    };
    match (i32::try_from(d.width), i32::try_from(d.height)) {
        (Ok(width), Ok(height)) => Ok(Some((width, height))),
        _ => Err(RoutesError::InvalidRequest(format!(
            "dimensions {}x{} of image {} are out of range",
            d.width, d.height, image_id
        ))),
    }
}

async fn store_processed_image(
    conn: &mut PgConnection,
    result: &ProcessResult,
    attributes: &ImageAttributes,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE images
        SET status = 'done',
            content_type = $2,
            file_size = $3,
            sha256 = $4,
            etag = $5,
            original_width = $6,
            original_height = $7,
            processed_width = $8,
            processed_height = $9,
            error_code = NULL,
            processed_at = $10,
            updated_at = NOW()
        WHERE image_id = $1
        "#,
    )
    .bind(&result.image_id)
    .bind(&result.content_type)
    .bind(attributes.file_size)
    .bind(&result.sha256)
    .bind(&result.etag)
    .bind(attributes.original.map(|(width, _)| width))
    .bind(attributes.original.map(|(_, height)| height))
    .bind(attributes.processed.map(|(width, _)| width))
    .bind(attributes.processed.map(|(_, height)| height))
    .bind(result.processed_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn confirm_waypoint(
    conn: &mut PgConnection,
    waypoint_id: &str,
    image_id: &str,
    marker: Marker,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE waypoints
        SET image_id = $2,
            marker_x = $3,
            marker_y = $4,
            status = 'confirmed',
            pending_image_id = NULL,
            pending_marker_x = NULL,
            pending_marker_y = NULL,
            error_code = NULL,
            confirmed_at = COALESCE(confirmed_at, NOW()),
            updated_at = NOW()
        WHERE waypoint_id = $1
        "#,
    )
    .bind(waypoint_id)
    .bind(image_id)
    .bind(marker.x)
    .bind(marker.y)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn count_pending_waypoints(conn: &mut PgConnection, route_id: &str) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM waypoints WHERE route_id = $1 AND status = $2")
            .bind(route_id)
            .bind(WaypointStatus::Pending.as_str())
            .fetch_one(&mut *conn)
            .await?;
    Ok(count)
}

/// `preparing → ready`. Returns false if the route was not preparing.
async fn activate_route(conn: &mut PgConnection, route_id: &str) -> Result<bool> {
    let updated = sqlx::query(
        r#"
        UPDATE routes
        SET status = $2, ready_at = NOW(), updated_at = NOW()
        WHERE route_id = $1 AND status = $3
        "#,
    )
    .bind(route_id)
    .bind(RouteStatus::Ready.as_str())
    .bind(RouteStatus::Preparing.as_str())
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if updated == 1 {
        info!(route_id, "Route activated: all waypoints confirmed");
    }
    Ok(updated == 1)
}
