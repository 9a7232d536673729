// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for transactional reconciliation.

#[macro_use]
mod common;

use std::collections::HashMap;

use common::{assert_close, create_route, new_upload, processed, processed_with, schedule, test_pool};
use waymark_queue::message::DECODE_FAILED;
use waymark_queue::{Dimensions, Disposition, EntryHandler, ProcessResult, StreamEntry};
use waymark_routes::db;
use waymark_routes::domain::{Marker, RouteStatus, UploadPurpose, WaypointStatus};
use waymark_routes::reconcile::{self, ReconcileOutcome};
use waymark_routes::{MarkerRescale, ReconciliationConsumer};

fn four_places() -> MarkerRescale {
    MarkerRescale::new(4)
}

#[tokio::test]
async fn test_processed_result_confirms_waypoint() {
    skip_if_no_db!();
    let pool = test_pool().await;
    let (route, waypoints) = create_route(&pool, 1).await;
    let owner = schedule(&pool, &route.route_id, &waypoints[0].waypoint_id).await;

    let outcome = reconcile::reconcile_processed(&pool, &owner, &processed(&owner.image_id), &four_places())
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Confirmed { route_activated: true });

    let waypoint = db::get_waypoint(&pool, &owner.waypoint_id).await.unwrap().unwrap();
    assert_eq!(waypoint.status, WaypointStatus::Confirmed);
    assert_eq!(waypoint.image_id.as_deref(), Some(owner.image_id.as_str()));
    assert!(waypoint.pending_image_id.is_none());
    assert!(waypoint.confirmed_at.is_some());
    assert_close(waypoint.marker.x, 0.0476);
    assert_close(waypoint.marker.y, 0.0952);

    let image = db::get_image(&pool, &owner.image_id).await.unwrap().unwrap();
    assert_eq!(image.status, "done");
    assert_eq!(image.content_type.as_deref(), Some("image/webp"));
    assert_eq!(image.original_width, Some(4032));
    assert_eq!(image.processed_height, Some(1440));
    assert_eq!(image.file_size, Some(123_456));

    let route = db::get_route(&pool, &route.route_id).await.unwrap().unwrap();
    assert_eq!(route.status, RouteStatus::Ready);
    assert!(route.ready_at.is_some());
}

#[tokio::test]
async fn test_default_rescale_rounds_to_integers() {
    skip_if_no_db!();
    let pool = test_pool().await;
    let (route, waypoints) = create_route(&pool, 1).await;
    let owner = schedule(&pool, &route.route_id, &waypoints[0].waypoint_id).await;

    reconcile::reconcile_processed(&pool, &owner, &processed(&owner.image_id), &MarkerRescale::default())
        .await
        .unwrap();

    let waypoint = db::get_waypoint(&pool, &owner.waypoint_id).await.unwrap().unwrap();
    assert_eq!(waypoint.marker.x, (0.10f64 * 1920.0 / 4032.0).round());
    assert_eq!(waypoint.marker.y, (0.20f64 * 1440.0 / 3024.0).round());
}

#[tokio::test]
async fn test_redelivered_result_is_idempotent() {
    skip_if_no_db!();
    let pool = test_pool().await;
    let (route, waypoints) = create_route(&pool, 1).await;
    let owner = schedule(&pool, &route.route_id, &waypoints[0].waypoint_id).await;
    let result = processed(&owner.image_id);

    reconcile::reconcile_processed(&pool, &owner, &result, &four_places())
        .await
        .unwrap();
    let before = db::get_waypoint(&pool, &owner.waypoint_id).await.unwrap().unwrap();
    let route_before = db::get_route(&pool, &route.route_id).await.unwrap().unwrap();

    let outcome = reconcile::reconcile_processed(&pool, &owner, &result, &four_places())
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::AlreadyApplied);

    // Markers must not be rescaled twice.
    let after = db::get_waypoint(&pool, &owner.waypoint_id).await.unwrap().unwrap();
    assert_eq!(after.marker, before.marker);
    assert_eq!(after.updated_at, before.updated_at);
    let route_after = db::get_route(&pool, &route.route_id).await.unwrap().unwrap();
    assert_eq!(route_after.ready_at, route_before.ready_at);
}

#[tokio::test]
async fn test_route_activates_after_last_waypoint_in_any_order() {
    skip_if_no_db!();
    let pool = test_pool().await;
    let (route, waypoints) = create_route(&pool, 3).await;

    let mut owners = Vec::new();
    for waypoint in &waypoints {
        owners.push(schedule(&pool, &route.route_id, &waypoint.waypoint_id).await);
    }

    for (index, expected_activation) in [(2, false), (0, false), (1, true)] {
        let owner = &owners[index];
        let outcome = reconcile::reconcile_processed(&pool, owner, &processed(&owner.image_id), &four_places())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Confirmed {
                route_activated: expected_activation
            }
        );
        let status = db::get_route(&pool, &route.route_id).await.unwrap().unwrap().status;
        let expected = if expected_activation {
            RouteStatus::Ready
        } else {
            RouteStatus::Preparing
        };
        assert_eq!(status, expected);
    }
}

#[tokio::test]
async fn test_concurrent_confirmations_activate_route_once() {
    skip_if_no_db!();
    let pool = test_pool().await;
    let (route, waypoints) = create_route(&pool, 6).await;

    let mut owners = Vec::new();
    for waypoint in &waypoints {
        owners.push(schedule(&pool, &route.route_id, &waypoint.waypoint_id).await);
    }
    let results: Vec<ProcessResult> = owners.iter().map(|o| processed(&o.image_id)).collect();
    let rescale = four_places();

    let outcomes = futures::future::join_all(
        owners
            .iter()
            .zip(&results)
            .map(|(owner, result)| reconcile::reconcile_processed(&pool, owner, result, &rescale)),
    )
    .await;

    let activations = outcomes
        .into_iter()
        .map(|outcome| outcome.unwrap())
        .filter(|outcome| *outcome == ReconcileOutcome::Confirmed { route_activated: true })
        .count();
    assert_eq!(activations, 1);

    let route = db::get_route(&pool, &route.route_id).await.unwrap().unwrap();
    assert_eq!(route.status, RouteStatus::Ready);
    let waypoints = db::list_waypoints(&pool, &route.route_id).await.unwrap();
    assert!(waypoints.iter().all(|w| w.status == WaypointStatus::Confirmed));
}

#[tokio::test]
async fn test_failure_is_recorded_and_upload_can_be_retried() {
    skip_if_no_db!();
    let pool = test_pool().await;
    let (route, waypoints) = create_route(&pool, 2).await;
    let owner = schedule(&pool, &route.route_id, &waypoints[0].waypoint_id).await;

    let outcome = reconcile::record_failure(&pool, &owner, &ProcessResult::failed(&owner.image_id, DECODE_FAILED))
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Failed);

    let waypoint = db::get_waypoint(&pool, &owner.waypoint_id).await.unwrap().unwrap();
    assert_eq!(waypoint.status, WaypointStatus::Pending);
    assert_eq!(waypoint.error_code.as_deref(), Some(DECODE_FAILED));
    assert!(waypoint.pending_image_id.is_none());
    assert!(waypoint.image_id.is_none());

    let image = db::get_image(&pool, &owner.image_id).await.unwrap().unwrap();
    assert_eq!(image.status, "failed");
    assert_eq!(image.error_code.as_deref(), Some(DECODE_FAILED));

    let route_record = db::get_route(&pool, &route.route_id).await.unwrap().unwrap();
    assert_eq!(route_record.status, RouteStatus::Preparing);

    // A late success for the failed image is already terminal.
    let outcome = reconcile::reconcile_processed(&pool, &owner, &processed(&owner.image_id), &four_places())
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::AlreadyApplied);

    let retry = schedule(&pool, &route.route_id, &waypoints[0].waypoint_id).await;
    let outcome = reconcile::reconcile_processed(&pool, &retry, &processed(&retry.image_id), &four_places())
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Confirmed { route_activated: false });
    let waypoint = db::get_waypoint(&pool, &owner.waypoint_id).await.unwrap().unwrap();
    assert!(waypoint.error_code.is_none());
}

#[tokio::test]
async fn test_superseded_upload_only_updates_image() {
    skip_if_no_db!();
    let pool = test_pool().await;
    let (route, waypoints) = create_route(&pool, 1).await;
    let stale = schedule(&pool, &route.route_id, &waypoints[0].waypoint_id).await;
    let current = schedule(&pool, &route.route_id, &waypoints[0].waypoint_id).await;

    let outcome = reconcile::reconcile_processed(&pool, &stale, &processed(&stale.image_id), &four_places())
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Superseded);

    let waypoint = db::get_waypoint(&pool, &stale.waypoint_id).await.unwrap().unwrap();
    assert_eq!(waypoint.status, WaypointStatus::Pending);
    assert_eq!(waypoint.pending_image_id.as_deref(), Some(current.image_id.as_str()));
    assert_eq!(waypoint.marker, Marker::new(0.10, 0.20));
    assert_eq!(
        db::get_image(&pool, &stale.image_id).await.unwrap().unwrap().status,
        "done"
    );

    let outcome = reconcile::reconcile_processed(&pool, &current, &processed(&current.image_id), &four_places())
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Confirmed { route_activated: true });
}

#[tokio::test]
async fn test_replacement_keeps_route_published() {
    skip_if_no_db!();
    let pool = test_pool().await;
    let (route, waypoints) = create_route(&pool, 2).await;
    for waypoint in &waypoints {
        let owner = schedule(&pool, &route.route_id, &waypoint.waypoint_id).await;
        reconcile::reconcile_processed(&pool, &owner, &processed(&owner.image_id), &four_places())
            .await
            .unwrap();
    }
    let published = db::publish_route(&pool, &route.route_id).await.unwrap();
    assert_eq!(published.status, RouteStatus::Published);
    // Publishing twice is a no-op.
    assert_eq!(
        db::publish_route(&pool, &route.route_id).await.unwrap().published_at,
        published.published_at
    );

    let target = db::get_waypoint(&pool, &waypoints[1].waypoint_id).await.unwrap().unwrap();
    let other_before = db::get_waypoint(&pool, &waypoints[0].waypoint_id).await.unwrap().unwrap();
    let upload = new_upload(&route.route_id, &target.waypoint_id);
    db::request_replacement(&pool, &route.route_id, &target.waypoint_id, &upload, Marker::new(0.55, 0.65))
        .await
        .unwrap();

    let owner = db::resolve_image_owner(&pool, &upload.image_id).await.unwrap().unwrap();
    assert_eq!(owner.purpose, UploadPurpose::Replacement);
    let pending = db::get_waypoint(&pool, &target.waypoint_id).await.unwrap().unwrap();
    assert_eq!(pending.pending_marker, Some(Marker::new(0.55, 0.65)));
    assert_eq!(pending.image_id, target.image_id);

    let same_size = processed_with(&upload.image_id, Dimensions::new(1600, 1200), Dimensions::new(1600, 1200));
    let outcome = reconcile::reconcile_processed(&pool, &owner, &same_size, &four_places())
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Replaced);

    let replaced = db::get_waypoint(&pool, &target.waypoint_id).await.unwrap().unwrap();
    assert_eq!(replaced.image_id.as_deref(), Some(upload.image_id.as_str()));
    assert_close(replaced.marker.x, 0.55);
    assert_close(replaced.marker.y, 0.65);
    assert!(replaced.pending_marker.is_none());
    assert_eq!(replaced.confirmed_at, target.confirmed_at);

    let other_after = db::get_waypoint(&pool, &waypoints[0].waypoint_id).await.unwrap().unwrap();
    assert_eq!(other_after, other_before);

    let route = db::get_route(&pool, &route.route_id).await.unwrap().unwrap();
    assert_eq!(route.status, RouteStatus::Published);
}

#[tokio::test]
async fn test_result_for_deleted_route_is_owner_missing() {
    skip_if_no_db!();
    let pool = test_pool().await;
    let (route, waypoints) = create_route(&pool, 1).await;
    let owner = schedule(&pool, &route.route_id, &waypoints[0].waypoint_id).await;

    db::delete_route_records(&pool, &route.route_id).await.unwrap();

    let outcome = reconcile::reconcile_processed(&pool, &owner, &processed(&owner.image_id), &four_places())
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::OwnerMissing);

    let consumer = ReconciliationConsumer::new(pool.clone(), four_places());
    let outcome = consumer.apply(&processed(&owner.image_id)).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::OwnerMissing);
}

#[tokio::test]
async fn test_consumer_acks_applied_and_malformed_entries() {
    skip_if_no_db!();
    let pool = test_pool().await;
    let (route, waypoints) = create_route(&pool, 1).await;
    let owner = schedule(&pool, &route.route_id, &waypoints[0].waypoint_id).await;
    let consumer = ReconciliationConsumer::new(pool.clone(), four_places());

    let fields: HashMap<String, String> = processed(&owner.image_id)
        .to_fields()
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect();
    let entry = StreamEntry {
        id: "1-0".to_string(),
        fields,
    };
    assert_eq!(consumer.handle(&entry).await, Disposition::Ack);
    // Redelivery of the same entry is acknowledged without side effects.
    assert_eq!(consumer.handle(&entry).await, Disposition::Ack);

    let malformed = StreamEntry {
        id: "2-0".to_string(),
        fields: HashMap::from([("status".to_string(), "processed".to_string())]),
    };
    assert_eq!(consumer.handle(&malformed).await, Disposition::Ack);

    let route = db::get_route(&pool, &route.route_id).await.unwrap().unwrap();
    assert_eq!(route.status, RouteStatus::Ready);
}

fn result_entry(id: &str, result: &ProcessResult) -> StreamEntry {
    StreamEntry {
        id: id.to_string(),
        fields: result
            .to_fields()
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect(),
    }
}

#[tokio::test]
async fn test_database_error_rolls_back_and_leaves_result_pending() {
    skip_if_no_db!();
    let pool = test_pool().await;
    let (route, waypoints) = create_route(&pool, 1).await;
    let owner = schedule(&pool, &route.route_id, &waypoints[0].waypoint_id).await;
    let consumer = ReconciliationConsumer::new(pool.clone(), four_places());
    let before = db::get_waypoint(&pool, &owner.waypoint_id).await.unwrap().unwrap();

    // Reject updates to this waypoint only, after the image row was already written.
    let name = format!("reject_waypoint_{}", uuid::Uuid::new_v4().simple());
    sqlx::raw_sql(&format!(
        r#"
        CREATE FUNCTION {name}() RETURNS trigger LANGUAGE plpgsql AS $$
        BEGIN
            RAISE EXCEPTION 'waypoint update rejected';
        END
        $$;
        CREATE TRIGGER {name} BEFORE UPDATE ON waypoints
            FOR EACH ROW WHEN (OLD.waypoint_id = '{waypoint_id}')
            EXECUTE FUNCTION {name}();
        "#,
        name = name,
        waypoint_id = owner.waypoint_id,
    ))
    .execute(&pool)
    .await
    .unwrap();

    let entry = result_entry("1-0", &processed(&owner.image_id));
    let disposition = consumer.handle(&entry).await;

    sqlx::raw_sql(&format!(
        "DROP TRIGGER {name} ON waypoints; DROP FUNCTION {name}();",
        name = name
    ))
    .execute(&pool)
    .await
    .unwrap();

    assert_eq!(disposition, Disposition::Retry);

    let image = db::get_image(&pool, &owner.image_id).await.unwrap().unwrap();
    assert_eq!(image.status, "queued");
    assert!(image.processed_at.is_none());
    assert!(image.original_width.is_none());

    let waypoint = db::get_waypoint(&pool, &owner.waypoint_id).await.unwrap().unwrap();
    assert_eq!(waypoint, before);

    let unchanged = db::get_route(&pool, &route.route_id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, RouteStatus::Preparing);
    assert!(unchanged.ready_at.is_none());

    // The redelivered entry applies cleanly once the database accepts it.
    assert_eq!(consumer.handle(&entry).await, Disposition::Ack);
    let waypoint = db::get_waypoint(&pool, &owner.waypoint_id).await.unwrap().unwrap();
    assert_eq!(waypoint.status, WaypointStatus::Confirmed);
    assert_eq!(waypoint.image_id.as_deref(), Some(owner.image_id.as_str()));
    let route = db::get_route(&pool, &route.route_id).await.unwrap().unwrap();
    assert_eq!(route.status, RouteStatus::Ready);
}

#[tokio::test]
async fn test_out_of_range_dimensions_are_acknowledged_without_changes() {
    skip_if_no_db!();
    let pool = test_pool().await;
    let (route, waypoints) = create_route(&pool, 1).await;
    let owner = schedule(&pool, &route.route_id, &waypoints[0].waypoint_id).await;
    let consumer = ReconciliationConsumer::new(pool.clone(), four_places());

    let corrupt = processed_with(
        &owner.image_id,
        Dimensions::new(u32::MAX, 3024),
        Dimensions::new(1920, 1440),
    );
    let err = reconcile::reconcile_processed(&pool, &owner, &corrupt, &four_places())
        .await
        .unwrap_err();
    assert!(err.is_client_error());
    assert_eq!(
        consumer.handle(&result_entry("1-0", &corrupt)).await,
        Disposition::Ack
    );

    let image = db::get_image(&pool, &owner.image_id).await.unwrap().unwrap();
    assert_eq!(image.status, "queued");
    let waypoint = db::get_waypoint(&pool, &owner.waypoint_id).await.unwrap().unwrap();
    assert_eq!(waypoint.status, WaypointStatus::Pending);
    assert_eq!(waypoint.pending_image_id.as_deref(), Some(owner.image_id.as_str()));
}
