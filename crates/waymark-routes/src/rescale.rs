// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Marker rescaling between original and processed image dimensions.
//!
//! Markers are placed by the client against the uploaded original. After
//! the pipeline resizes the image each axis is multiplied by
//! `processed / original` and rounded to `precision` decimal places.
//! Precision `0` rounds to whole numbers.
//!
//! # Deployment note
//!
//! Markers are normalized to `0.0..=1.0`, so the default precision of `0`
//! snaps every confirmed marker to `0` or `1`. Deployments storing normalized
//! markers must set `WAYMARK_MARKER_PRECISION` (4 keeps pixel accuracy
//! on a 10k-pixel axis). The binary warns at startup when it is left at `0`.

use serde::{Deserialize, Serialize};
use waymark_queue::Dimensions;

use crate::domain::Marker;

const MAX_PRECISION: u32 = 12;

/// Rescaling policy applied when a processed image is reconciled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerRescale {
    precision: u32,
}

impl MarkerRescale {
    /// Keep `precision` decimal places (capped at 12).
    pub fn new(precision: u32) -> Self {
        Self {
            precision: precision.min(MAX_PRECISION),
        }
    }

    /// Decimal places kept.
    pub fn precision(&self) -> u32 {
        self.precision
    }

    /// Whether normalized markers collapse to `0` or `1` under this policy.
    pub fn collapses_normalized(&self) -> bool {
        self.precision == 0
    }

    /// Rescale one axis. A zero dimension leaves the value unchanged.
    pub fn rescale_axis(&self, value: f64, original: u32, processed: u32) -> f64 {
        if original == 0 || processed == 0 {
            return value;
        }
        self.round(value * processed as f64 / original as f64)
    }

    /// Rescale a marker. Missing dimensions leave it unchanged.
    pub fn rescale(
        &self,
        marker: Marker,
        original: Option<Dimensions>,
        processed: Option<Dimensions>,
    ) -> Marker {
        match (original, processed) {
            (Some(original), Some(processed)) => Marker::new(
                self.rescale_axis(marker.x, original.width, processed.width),
                self.rescale_axis(marker.y, original.height, processed.height),
            ),
            _ => marker,
        }
    }

    fn round(&self, value: f64) -> f64 {
        let factor = 10f64.powi(self.precision as i32);
        (value * factor).round() / factor
    }
}
