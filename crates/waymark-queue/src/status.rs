// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ephemeral per-image status hash (`image:status:{id}`).
//!
//! Written by the producer (`queued`) and by the processing worker on every
//! stage transition. Every write refreshes the TTL so an abandoned pipeline
//! cleans itself up.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::keys::status_key;
use crate::message::ImageStage;

/// Upper bound for the status TTL.
pub const MAX_STATUS_TTL: Duration = Duration::from_secs(3600);

/// Snapshot of an image's pipeline status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStatus {
    /// Current stage.
    pub stage: ImageStage,
    /// Failure code when `stage` is `failed`.
    pub error_code: Option<String>,
    /// When the stage was last written.
    pub updated_at: Option<DateTime<Utc>>,
}

/// Reader/writer for status hashes.
#[derive(Clone)]
pub struct StatusStore {
    conn: ConnectionManager,
    ttl: Duration,
}

impl StatusStore {
    /// Create a store; `ttl` is capped at [`MAX_STATUS_TTL`].
    pub fn new(conn: ConnectionManager, ttl: Duration) -> Self {
        Self {
            conn,
            ttl: ttl.min(MAX_STATUS_TTL),
        }
    }

    /// Effective TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record `stage` for `image_id` and refresh the TTL.
    ///
    /// A stage without `error_code` clears any previous code.
    pub async fn set_stage(
        &self,
        image_id: &str,
        stage: ImageStage,
        error_code: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = status_key(image_id);

        let mut fields = vec![
            ("stage", stage.as_str().to_string()),
            ("updated_at", Utc::now().to_rfc3339()),
        ];
        if let Some(code) = error_code {
            fields.push(("error_code", code.to_string()));
        }

        let mut pipe = redis::pipe();
        pipe.atomic().hset_multiple(&key, &fields).ignore();
        if error_code.is_none() {
            pipe.hdel(&key, "error_code").ignore();
        }
        pipe.cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl.as_secs().max(1))
            .ignore();
        let () = pipe.query_async(&mut conn).await?;

        debug!(image_id, stage = %stage, "Status updated");
        Ok(())
    }

    /// Current status, or `None` if the hash expired or was never written.
    pub async fn get(&self, image_id: &str) -> Result<Option<ImageStatus>> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn.hgetall(status_key(image_id)).await?;
        Ok(parse_status(image_id, &raw))
    }
}

fn parse_status(image_id: &str, raw: &HashMap<String, String>) -> Option<ImageStatus> {
    let stage = raw.get("stage")?;
    let stage = match stage.parse::<ImageStage>() {
        Ok(stage) => stage,
        Err(e) => {
            warn!(image_id, error = %e, "Ignoring status hash with unknown stage");
            return None;
        }
    };
    let updated_at = raw
        .get("updated_at")
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc));

    Some(ImageStatus {
        stage,
        error_code: raw.get("error_code").cloned(),
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        let mut raw = HashMap::new();
        assert_eq!(parse_status("i", &raw), None);

        raw.insert("stage".to_string(), "failed".to_string());
        raw.insert("error_code".to_string(), "FILE_TOO_LARGE".to_string());
        raw.insert(
            "updated_at".to_string(),
            "2025-01-01T00:00:00+00:00".to_string(),
        );
        let status = parse_status("i", &raw).unwrap();
        assert_eq!(status.stage, ImageStage::Failed);
        assert_eq!(status.error_code.as_deref(), Some("FILE_TOO_LARGE"));
        assert!(status.updated_at.is_some());

        raw.insert("stage".to_string(), "sleeping".to_string());
        assert_eq!(parse_status("i", &raw), None);
    }
}
