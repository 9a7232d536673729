// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable streams with consumer-group semantics.
//!
//! Both pipeline queues (`image:process` and `image:result`) are Redis streams.
//! Each consumer group keeps its own cursor and pending-entry list (PEL):
//!
//! ```text
//!   XADD ──► [ 1-0 | 2-0 | 3-0 | 4-0 ]
//!                         │
//!            XREADGROUP > │ (new entries, added to the group's PEL)
//!                         ▼
//!              consumer-a: 1-0 2-0     consumer-b: 3-0
//!                         │
//!               XACK ─────┘  (removes from PEL)
//!
//!   consumer-b crashes ──► 3-0 stays pending ──► XCLAIM by consumer-a
//!                                                 once idle >= min_idle
//! ```
//!
//! Reclaimed entries may arrive out of order relative to fresh ones, so every
//! handler must tolerate redelivery.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamReadOptions,
    StreamReadReply,
};
use tracing::{debug, warn};

use crate::error::{QueueError, Result};

/// One stream entry with its fields decoded as strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Monotonic entry ID assigned by Redis.
    pub id: String,
    /// Entry fields.
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    fn from_stream_id(entry: &StreamId) -> Self {
        let fields = entry
            .map
            .keys()
            .filter_map(|key| entry.get::<String>(key).map(|value| (key.clone(), value)))
            .collect();
        Self {
            id: entry.id.clone(),
            fields,
        }
    }

    /// Field value, if present.
    pub fn optional(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// Field value, or a malformed-message error.
    pub fn required(&self, field: &'static str) -> Result<&str> {
        self.optional(field)
            .ok_or_else(|| QueueError::MalformedMessage {
                entry_id: self.id.clone(),
                field,
                reason: "is missing".to_string(),
            })
    }

    /// Parse a required field.
    pub fn parsed<T>(&self, field: &'static str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.required(field)?;
        raw.parse().map_err(|e: T::Err| QueueError::MalformedMessage {
            entry_id: self.id.clone(),
            field,
            reason: format!("'{}' is invalid: {}", raw, e),
        })
    }

    /// Parse an optional field.
    pub fn optional_parsed<T>(&self, field: &'static str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(field) {
            Some(_) => self.parsed(field).map(Some),
            None => Ok(None),
        }
    }

    /// Parse a required RFC 3339 timestamp field.
    pub fn timestamp(&self, field: &'static str) -> Result<DateTime<Utc>> {
        let raw = self.required(field)?;
        DateTime::parse_from_rfc3339(raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| QueueError::MalformedMessage {
                entry_id: self.id.clone(),
                field,
                reason: format!("'{}' is not RFC 3339: {}", raw, e),
            })
    }
}

/// Handle to one Redis stream.
///
/// Cloning is cheap; clones share the underlying connection. Roles that issue
/// blocking reads should be given their own connection so the `BLOCK` does
/// not hold up unrelated commands.
#[derive(Clone)]
pub struct StreamQueue {
    conn: ConnectionManager,
    stream: String,
}

impl StreamQueue {
    /// Create a handle for `stream`.
    pub fn new(conn: ConnectionManager, stream: impl Into<String>) -> Self {
        Self {
            conn,
            stream: stream.into(),
        }
    }

    /// Stream key.
    pub fn name(&self) -> &str {
        &self.stream
    }

    /// Create the consumer group (and the stream) if missing.
    ///
    /// New groups start at the beginning of the stream so entries appended
    /// before the first consumer came up are not skipped.
    pub async fn ensure_group(&self, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> =
            conn.xgroup_create_mkstream(&self.stream, group, "0").await;
        match created {
            Ok(()) => {
                debug!(stream = %self.stream, group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Append an entry and return its ID.
    pub async fn publish(&self, fields: &[(&'static str, String)]) -> Result<String> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(&self.stream, "*", fields).await?;
        Ok(id)
    }

    /// Claim up to `count` never-delivered entries for `consumer`.
    ///
    /// Blocks for at most `block`; a timeout yields an empty batch.
    pub async fn read(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream], &[">"], &options)
            .await?;

        Ok(reply
            .map(|reply| {
                reply
                    .keys
                    .iter()
                    .flat_map(|key| key.ids.iter().map(StreamEntry::from_stream_id))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Acknowledge entries, removing them from the group's PEL.
    ///
    /// Returns how many entries were actually pending.
    pub async fn ack(&self, group: &str, ids: &[&str]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let acked: u64 = conn.xack(&self.stream, group, ids).await?;
        Ok(acked)
    }

    /// Number of delivered-but-unacknowledged entries in the group.
    pub async fn pending_count(&self, group: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingReply = conn.xpending(&self.stream, group).await?;
        Ok(reply.count() as u64)
    }

    /// Reassign up to `count` entries idle for at least `min_idle` to `consumer`.
    ///
    /// The `XCLAIM` repeats the idle check, so an entry a live consumer
    /// touched in the meantime is not stolen. Entries trimmed from the stream
    /// while pending come back without fields; they are acknowledged and
    /// skipped.
    pub async fn reclaim(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let min_idle_ms = min_idle.as_millis() as u64;

        // IDLE filters on the server; otherwise `count` busy low-id entries
        // would hide older idle ones further down the PEL.
        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        let idle: Vec<String> = pending.ids.into_iter().map(|p| p.id).collect();

        if idle.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: StreamClaimReply = conn
            .xclaim(&self.stream, group, consumer, min_idle_ms, idle.as_slice())
            .await?;

        let trimmed: Vec<&str> = claimed
            .ids
            .iter()
            .filter(|e| e.map.is_empty())
            .map(|e| e.id.as_str())
            .collect();
        if !trimmed.is_empty() {
            warn!(
                stream = %self.stream,
                group,
                count = trimmed.len(),
                "Acknowledging pending entries that were trimmed from the stream"
            );
            self.ack(group, &trimmed).await?;
        }

        let entries: Vec<StreamEntry> = claimed
            .ids
            .iter()
            .filter(|e| !e.map.is_empty())
            .map(StreamEntry::from_stream_id)
            .collect();

        debug!(
            stream = %self.stream,
            group,
            consumer,
            reclaimed = entries.len(),
            "Reclaimed idle entries"
        );

        Ok(entries)
    }

    /// Number of entries currently retained in the stream.
    pub async fn len(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.xlen(&self.stream).await?;
        Ok(len)
    }
}
