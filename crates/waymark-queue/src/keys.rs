// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis key layout shared by producers and consumers.

/// Stream carrying processing jobs.
pub const PROCESS_STREAM: &str = "image:process";

/// Stream carrying terminal processing outcomes.
pub const RESULT_STREAM: &str = "image:result";

/// Default consumer group of the processing workers.
pub const DEFAULT_WORKER_GROUP: &str = "image-workers";

/// Per-image status hash key: `image:status:{image_id}`.
pub fn status_key(image_id: &str) -> String {
    format!("image:status:{}", image_id)
}

/// Per-image upload guard key: `image:upload:{image_id}`.
pub fn upload_guard_key(image_id: &str) -> String {
    format!("image:upload:{}", image_id)
}
