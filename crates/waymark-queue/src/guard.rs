// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Upload guard: at most one accepted upload per image within a TTL window.
//!
//! The guard is a single `SET image:upload:{id} 1 NX EX <ttl>`. There is no
//! release: the key expires on its own, so a worker that dies never leaves an
//! image locked forever, and an image cannot be re-submitted until the window
//! has passed.

use std::time::Duration;

use redis::aio::ConnectionManager;
use tracing::debug;

use crate::error::Result;
use crate::keys::upload_guard_key;

/// Default guard lifetime. Must cover the worst-case processing time.
pub const DEFAULT_GUARD_TTL: Duration = Duration::from_secs(900);

/// Distributed test-and-set guard keyed by image ID.
#[derive(Clone)]
pub struct UploadGuard {
    conn: ConnectionManager,
    ttl: Duration,
}

impl UploadGuard {
    /// Create a guard whose keys live for `ttl` (rounded up to whole seconds).
    pub fn new(conn: ConnectionManager, ttl: Duration) -> Self {
        Self { conn, ttl }
    }

    /// Guard lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Try to take the guard for `image_id`.
    ///
    /// Returns `true` if the key was absent and is now set, `false` if another
    /// attempt already holds it. Redis errors are returned, never treated as
    /// success.
    pub async fn acquire(&self, image_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let key = upload_guard_key(image_id);
        let reply: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(self.ttl))
            .query_async(&mut conn)
            .await?;

        let acquired = reply.is_some();
        debug!(image_id, acquired, "Upload guard acquisition");
        Ok(acquired)
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 || secs == 0 {
        secs + 1
    } else {
        secs
    }
}
