// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Image processor backends.
//!
//! The transform algorithm itself lives outside this crate; the worker only
//! drives an [`ImageProcessor`] through its stages.

pub mod mock;
pub mod traits;

pub use mock::{MockImageProcessor, MockUpload};
pub use traits::*;
