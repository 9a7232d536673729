// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for consumer-group reads, acknowledgement and PEL recovery.

#[macro_use]
mod common;

use std::time::Duration;

use common::TestRedis;

const SHORT_BLOCK: Duration = Duration::from_millis(50);

#[tokio::test]
async fn test_read_timeout_returns_empty_batch() {
    skip_if_no_redis!();
    let mut redis = TestRedis::new().await.unwrap();
    let queue = redis.stream("jobs");
    queue.ensure_group("workers").await.unwrap();

    let entries = queue.read("workers", "c1", 10, SHORT_BLOCK).await.unwrap();
    assert!(entries.is_empty());

    redis.cleanup().await;
}

#[tokio::test]
async fn test_ensure_group_is_idempotent() {
    skip_if_no_redis!();
    let mut redis = TestRedis::new().await.unwrap();
    let queue = redis.stream("jobs");

    queue.ensure_group("workers").await.unwrap();
    queue.ensure_group("workers").await.unwrap();

    redis.cleanup().await;
}

#[tokio::test]
async fn test_unacked_entry_stays_pending() {
    skip_if_no_redis!();
    let mut redis = TestRedis::new().await.unwrap();
    let queue = redis.stream("jobs");
    queue.ensure_group("workers").await.unwrap();

    let id = queue
        .publish(&[("image_id", "img-1".to_string())])
        .await
        .unwrap();

    let entries = queue.read("workers", "c1", 10, SHORT_BLOCK).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, id);
    assert_eq!(entries[0].optional("image_id"), Some("img-1"));
    assert_eq!(queue.pending_count("workers").await.unwrap(), 1);

    // Not redelivered as a new entry, to this or any other consumer.
    assert!(queue.read("workers", "c1", 10, SHORT_BLOCK).await.unwrap().is_empty());
    assert!(queue.read("workers", "c2", 10, SHORT_BLOCK).await.unwrap().is_empty());
    assert_eq!(queue.pending_count("workers").await.unwrap(), 1);

    redis.cleanup().await;
}

#[tokio::test]
async fn test_idle_entry_is_reclaimed_by_another_consumer() {
    skip_if_no_redis!();
    let mut redis = TestRedis::new().await.unwrap();
    let queue = redis.stream("jobs");
    queue.ensure_group("workers").await.unwrap();

    queue.publish(&[("n", "1".to_string())]).await.unwrap();
    queue.publish(&[("n", "2".to_string())]).await.unwrap();
    let delivered = queue.read("workers", "crashed", 10, SHORT_BLOCK).await.unwrap();
    assert_eq!(delivered.len(), 2);
    assert_eq!(queue.pending_count("workers").await.unwrap(), 2);

    // Not idle long enough yet.
    let early = queue
        .reclaim("workers", "rescuer", Duration::from_secs(60), 1)
        .await
        .unwrap();
    assert!(early.is_empty());

    tokio::time::sleep(Duration::from_millis(150)).await;

    let reclaimed = queue
        .reclaim("workers", "rescuer", Duration::from_millis(100), 1)
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, delivered[0].id);
    assert_eq!(reclaimed[0].optional("n"), Some("1"));

    let acked = queue
        .ack("workers", &[reclaimed[0].id.as_str()])
        .await
        .unwrap();
    assert_eq!(acked, 1);
    assert_eq!(queue.pending_count("workers").await.unwrap(), 1);

    redis.cleanup().await;
}

#[tokio::test]
async fn test_idle_entry_behind_busy_entries_is_reclaimed() {
    skip_if_no_redis!();
    let mut redis = TestRedis::new().await.unwrap();
    let queue = redis.stream("jobs");
    queue.ensure_group("workers").await.unwrap();

    for n in 1..=3 {
        queue.publish(&[("n", n.to_string())]).await.unwrap();
    }
    let delivered = queue.read("workers", "crashed", 10, SHORT_BLOCK).await.unwrap();
    assert_eq!(delivered.len(), 3);

    tokio::time::sleep(Duration::from_millis(300)).await;

    // A live consumer keeps retrying the two lowest entries, resetting their idle time.
    let busy = queue
        .reclaim("workers", "live", Duration::ZERO, 2)
        .await
        .unwrap();
    assert_eq!(busy.len(), 2);
    assert_eq!(busy[0].id, delivered[0].id);
    assert_eq!(busy[1].id, delivered[1].id);

    let reclaimed = queue
        .reclaim("workers", "rescuer", Duration::from_millis(200), 2)
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, delivered[2].id);
    assert_eq!(reclaimed[0].optional("n"), Some("3"));
    assert_eq!(queue.pending_count("workers").await.unwrap(), 3);

    redis.cleanup().await;
}

#[tokio::test]
async fn test_groups_have_independent_cursors() {
    skip_if_no_redis!();
    let mut redis = TestRedis::new().await.unwrap();
    let queue = redis.stream("results");
    queue.ensure_group("reconciler").await.unwrap();
    queue.ensure_group("observer").await.unwrap();

    queue
        .publish(&[("image_id", "img-1".to_string())])
        .await
        .unwrap();

    let a = queue.read("reconciler", "c1", 10, SHORT_BLOCK).await.unwrap();
    let b = queue.read("observer", "c1", 10, SHORT_BLOCK).await.unwrap();
    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 1);
    assert_eq!(a[0].id, b[0].id);

    queue.ack("reconciler", &[a[0].id.as_str()]).await.unwrap();
    assert_eq!(queue.pending_count("reconciler").await.unwrap(), 0);
    assert_eq!(queue.pending_count("observer").await.unwrap(), 1);

    redis.cleanup().await;
}

#[tokio::test]
async fn test_ack_of_unknown_entry_counts_zero() {
    skip_if_no_redis!();
    let mut redis = TestRedis::new().await.unwrap();
    let queue = redis.stream("jobs");
    queue.ensure_group("workers").await.unwrap();

    assert_eq!(queue.ack("workers", &["1-0"]).await.unwrap(), 0);
    assert_eq!(queue.ack("workers", &[]).await.unwrap(), 0);

    redis.cleanup().await;
}
