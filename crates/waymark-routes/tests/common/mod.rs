// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for waymark-routes integration tests.
//!
//! Every route is created with fresh UUIDs, so tests can share one database.

#![allow(dead_code)]

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use waymark_queue::{Dimensions, ProcessResult};
use waymark_routes::db::{self, ImageOwner, NewRoute, NewUpload, NewWaypoint, RouteRecord, WaypointRecord};
use waymark_routes::domain::{AccessMethod, LifecycleType, Marker, Visibility};
use waymark_routes::migrations;

/// Helper macro to skip tests if the database URL is not set.
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_WAYMARK_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_WAYMARK_DATABASE_URL not set");
            return;
        }
    };
}

/// Helper macro to skip tests unless both PostgreSQL and Redis are available.
macro_rules! skip_if_no_services {
    () => {
        if std::env::var("TEST_WAYMARK_DATABASE_URL").is_err()
            || std::env::var("TEST_WAYMARK_REDIS_URL").is_err()
        {
            eprintln!("Skipping test: TEST_WAYMARK_DATABASE_URL or TEST_WAYMARK_REDIS_URL not set");
            return;
        }
    };
}

/// Connect to `TEST_WAYMARK_DATABASE_URL` and apply migrations.
pub async fn test_pool() -> PgPool {
    let url = std::env::var("TEST_WAYMARK_DATABASE_URL").expect("TEST_WAYMARK_DATABASE_URL not set");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("Failed to connect to test database");
    migrations::run(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

/// A route definition with `count` waypoints spread along the diagonal.
pub fn new_route(count: usize) -> NewRoute {
    NewRoute {
        owner_id: format!("owner-{}", Uuid::new_v4().simple()),
        title: "Old town walk".to_string(),
        visibility: Visibility::Private,
        access_method: AccessMethod::Open,
        lifecycle_type: LifecycleType::Permanent,
        waypoints: (0..count)
            .map(|i| NewWaypoint {
                title: Some(format!("Stop {}", i + 1)),
                marker: Marker::new(0.10, 0.20),
                marker_type: "pin".to_string(),
            })
            .collect(),
    }
}

/// Create a route and return it with its waypoints.
pub async fn create_route(pool: &PgPool, count: usize) -> (RouteRecord, Vec<WaypointRecord>) {
    let route = db::create_route(pool, &new_route(count)).await.unwrap();
    let waypoints = db::list_waypoints(pool, &route.route_id).await.unwrap();
    (route, waypoints)
}

/// Upload parameters with fresh ids.
pub fn new_upload(route_id: &str, waypoint_id: &str) -> NewUpload {
    let image_id = Uuid::new_v4().to_string();
    NewUpload {
        storage_key: format!("routes/{}/waypoints/{}/{}", route_id, waypoint_id, image_id),
        image_id,
        expected_content_type: "image/jpeg".to_string(),
        max_file_size: 10 * 1024 * 1024,
        upload_token: Uuid::new_v4().simple().to_string(),
    }
}

/// Schedule an initial upload and return its owner row.
pub async fn schedule(pool: &PgPool, route_id: &str, waypoint_id: &str) -> ImageOwner {
    let upload = new_upload(route_id, waypoint_id);
    db::schedule_upload(pool, route_id, waypoint_id, &upload)
        .await
        .unwrap();
    db::resolve_image_owner(pool, &upload.image_id)
        .await
        .unwrap()
        .unwrap()
}

/// A processed result for a 4032x3024 original resized to 1920x1440.
pub fn processed(image_id: &str) -> ProcessResult {
    processed_with(image_id, Dimensions::new(4032, 3024), Dimensions::new(1920, 1440))
}

/// A processed result with explicit dimensions.
pub fn processed_with(image_id: &str, original: Dimensions, resized: Dimensions) -> ProcessResult {
    ProcessResult::processed(
        image_id,
        "ab".repeat(32),
        format!("etag-{}", image_id),
        123_456,
        "image/webp",
        original,
        resized,
    )
}

/// Float comparison for rescaled markers.
pub fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {}, got {}",
        expected,
        actual
    );
}
