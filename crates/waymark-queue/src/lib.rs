// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Waymark Queue - Image Ingestion Pipeline
//!
//! This crate moves uploaded images through processing with at-least-once
//! delivery over Redis streams. It knows nothing about the domain that owns
//! the images: messages carry image-scoped fields only, and consumers of the
//! result stream resolve ownership themselves.
//!
//! # Architecture
//!
//! ```text
//!   domain service
//!        │ UploadIntake::submit
//!        ▼
//! ┌──────────────┐  SET NX EX   ┌─────────────────────┐
//! │ Upload Guard │─────────────►│ image:upload:{id}   │
//! └──────┬───────┘              └─────────────────────┘
//!        │ queued
//!        ▼
//! ┌──────────────┐   XREADGROUP  ┌────────────────────┐  HSET   ┌────────────────────┐
//! │image:process │──────────────►│ ProcessingWorker   │────────►│ image:status:{id}  │
//! └──────────────┘ image-workers └─────────┬──────────┘         └────────────────────┘
//!                                          │ XADD
//!                                          ▼
//!                                 ┌────────────────┐  XREADGROUP
//!                                 │ image:result   │─────────────► domain reconciler
//!                                 └────────────────┘
//! ```
//!
//! Every consumer runs inside a [`consumer::StreamConsumer`]: bounded
//! blocking reads, acknowledgement only after the handler succeeded, and a
//! periodic reclaim sweep of idle pending entries for crash recovery.
//!
//! # Keys
//!
//! | Key | Type | Purpose |
//! |-----|------|---------|
//! | `image:process` | stream | processing jobs |
//! | `image:result` | stream | terminal outcomes |
//! | `image:status:{id}` | hash | current stage, optional `error_code`, TTL ≤ 3600s |
//! | `image:upload:{id}` | string | upload guard, expires on its own |
//!
//! # Modules
//!
//! - [`keys`]: Stream and key names
//! - [`message`]: Job and result messages
//! - [`stream`]: Consumer-group operations on one stream
//! - [`guard`]: Duplicate-upload guard
//! - [`status`]: Per-image status hash
//! - [`intake`]: Producer entry point
//! - [`processor`]: Image processor seam
//! - [`consumer`]: Shared polling loop
//! - [`worker`]: Processing worker

#![deny(missing_docs)]

/// Error types for pipeline operations.
pub mod error;

/// Stream names and per-image key layout.
pub mod keys;

/// Job and result message encoding.
pub mod message;

/// Consumer-group operations on a single stream.
pub mod stream;

/// Upload guard preventing duplicate processing of one image.
pub mod guard;

/// Ephemeral per-image status hash.
pub mod status;

/// Job submission used by domain services.
pub mod intake;

/// Image processor trait and mock backend.
pub mod processor;

/// Consumer-group polling loop.
pub mod consumer;

/// Processing worker.
pub mod worker;

pub use consumer::{ConsumerConfig, Disposition, EntryHandler, StreamConsumer};
pub use error::{QueueError, Result};
pub use guard::UploadGuard;
pub use intake::UploadIntake;
pub use message::{Dimensions, ImageStage, ProcessJob, ProcessResult, ResultStatus};
pub use status::{ImageStatus, StatusStore};
pub use stream::{StreamEntry, StreamQueue};
pub use worker::ProcessingWorker;

use redis::aio::ConnectionManager;

/// Open a managed connection to `redis_url`.
///
/// The manager reconnects on its own; give each long-running consumer its own
/// manager so one blocking read does not hold up other commands.
pub async fn connect(redis_url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(redis_url)?;
    let manager = ConnectionManager::new(client).await?;
    Ok(manager)
}
