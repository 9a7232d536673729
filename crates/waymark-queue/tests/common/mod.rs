// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for waymark-queue integration tests.
//!
//! Every context gets its own key prefix so tests can share one Redis.

#![allow(dead_code)]

use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use waymark_queue::consumer::ConsumerConfig;
use waymark_queue::stream::StreamQueue;

/// Helper macro to skip tests if the Redis URL is not set.
macro_rules! skip_if_no_redis {
    () => {
        if std::env::var("TEST_WAYMARK_REDIS_URL").is_err() {
            eprintln!("Skipping test: TEST_WAYMARK_REDIS_URL not set");
            return;
        }
    };
}

/// Redis connection plus a unique namespace for stream keys.
pub struct TestRedis {
    pub conn: ConnectionManager,
    pub prefix: String,
    streams: Vec<String>,
}

impl TestRedis {
    /// Connect to `TEST_WAYMARK_REDIS_URL`.
    pub async fn new() -> Result<Self, String> {
        let url = std::env::var("TEST_WAYMARK_REDIS_URL")
            .map_err(|_| "TEST_WAYMARK_REDIS_URL not set")?;
        let conn = waymark_queue::connect(&url)
            .await
            .map_err(|e| format!("Failed to connect to Redis: {}", e))?;
        Ok(Self {
            conn,
            prefix: format!("test:{}", Uuid::new_v4().simple()),
            streams: Vec::new(),
        })
    }

    /// A stream handle under this context's prefix.
    pub fn stream(&mut self, name: &str) -> StreamQueue {
        let key = format!("{}:{}", self.prefix, name);
        self.streams.push(key.clone());
        StreamQueue::new(self.conn.clone(), key)
    }

    /// Consumer settings suitable for tests: short blocks, fast reclaim.
    pub fn consumer_config(&self, group: &str, consumer: &str) -> ConsumerConfig {
        ConsumerConfig {
            group: group.to_string(),
            consumer: consumer.to_string(),
            batch_size: 10,
            block_timeout: Duration::from_millis(100),
            reclaim_min_idle: Duration::from_millis(50),
            reclaim_interval: Duration::from_millis(50),
            error_backoff: Duration::from_millis(50),
        }
    }

    /// Delete every stream created through this context.
    pub async fn cleanup(&self) {
        let mut conn = self.conn.clone();
        for key in &self.streams {
            let _: Result<(), _> = conn.del(key).await;
        }
    }
}

/// A fresh image id.
pub fn image_id() -> String {
    Uuid::new_v4().to_string()
}
