// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Waymark Routes - Route and Waypoint Reconciliation
//!
//! This crate owns the route aggregate and applies processed images to it.
//! Routes are created with every waypoint `pending`; each waypoint receives
//! an image through the pipeline in `waymark-queue`, and the route becomes
//! `ready` in the same transaction that confirms its last pending waypoint.
//!
//! # Architecture
//!
//! ```text
//!  HTTP layer ──► RouteService ──► PostgreSQL (routes, waypoints, images, image_owners)
//!                      │
//!                      │ UploadIntake::submit
//!                      ▼
//!              image:process ──► ProcessingWorker ──► image:result
//!                                                          │
//!                                                          ▼
//!                                            ReconciliationConsumer
//!                                                          │ resolve image_owners
//!                                                          ▼
//!                                      one transaction: image ─► waypoint ─► route
//! ```
//!
//! # Route lifecycle
//!
//! ```text
//!  preparing ──(last waypoint confirmed)──► ready ──(publish)──► published
//! ```
//!
//! Image replacement on a published route swaps one waypoint's image and
//! markers and never moves the route backwards.
//!
//! # Modules
//!
//! - [`config`]: Environment configuration
//! - [`domain`]: Statuses, markers and limits
//! - [`db`]: Route, waypoint and image queries
//! - [`rescale`]: Marker rescaling
//! - [`reconcile`]: Transactional reconciliation
//! - [`reconciler`]: Result stream consumer
//! - [`service`]: Route service API
//! - [`object_store`]: Object storage seam
//! - [`runtime`]: Embeddable consumer runtime

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Database operations.
pub mod db;

/// Route domain types.
pub mod domain;

/// Error types.
pub mod error;

/// Embedded database migrations.
pub mod migrations;

/// Object storage seam.
pub mod object_store;

/// Reconciliation of processing results.
pub mod reconcile;

/// Reconciliation consumer on the result stream.
pub mod reconciler;

/// Marker rescaling.
pub mod rescale;

/// Embeddable runtime.
pub mod runtime;

/// Route service.
pub mod service;

pub use config::Config;
pub use domain::{Marker, RouteStatus, WaypointStatus};
pub use error::{Result, RoutesError};
pub use object_store::{MemoryObjectStore, ObjectStore};
pub use reconcile::ReconcileOutcome;
pub use reconciler::ReconciliationConsumer;
pub use rescale::MarkerRescale;
pub use runtime::PipelineRuntime;
pub use service::{DeletionSummary, RouteService, RouteSnapshot, UploadSettings, UploadTicket};
