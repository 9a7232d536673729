// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Route and waypoint domain types.
//!
//! # Route Status State Machine
//!
//! ```text
//!   ┌───────────┐  last waypoint   ┌───────┐   publish   ┌───────────┐
//!   │ PREPARING │ ───confirmed────►│ READY │ ───────────►│ PUBLISHED │
//!   └───────────┘   (system)       └───────┘   (user)    └───────────┘
//!         │                            │                       │
//!         └────────────────────────────┴───── delete ──────────┘
//! ```
//!
//! There are no other backward transitions. Image replacement on a
//! published route swaps the waypoint image in place and leaves the route
//! published.

use serde::{Deserialize, Serialize};

/// Maximum waypoints on one route.
pub const MAX_WAYPOINTS: usize = 50;

/// Content types accepted for uploads.
pub const ALLOWED_CONTENT_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp", "image/heic"];

macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $label:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )+
        }

        impl $name {
            /// Stored representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text, )+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.to_lowercase().as_str() {
                    $( $text => Ok($name::$variant), )+
                    _ => Err(format!("Unknown {}: {}", $label, s)),
                }
            }
        }
    };
}

text_enum! {
    /// Route lifecycle status.
    RouteStatus, "route status" {
        /// Waypoints declared; at least one is still pending.
        Preparing => "preparing",
        /// Every waypoint is confirmed.
        Ready => "ready",
        /// Visible to its audience.
        Published => "published",
    }
}

impl RouteStatus {
    /// Whether `self → next` is a forward transition of the state machine.
    ///
    /// Deletion is not a status and is allowed from any state.
    pub fn can_transition_to(&self, next: RouteStatus) -> bool {
        matches!(
            (self, next),
            (RouteStatus::Preparing, RouteStatus::Ready)
                | (RouteStatus::Ready, RouteStatus::Published)
        )
    }

    /// Whether every waypoint is confirmed in this status.
    pub fn is_complete(&self) -> bool {
        !matches!(self, RouteStatus::Preparing)
    }
}

text_enum! {
    /// Waypoint status.
    WaypointStatus, "waypoint status" {
        /// No image processed yet.
        Pending => "pending",
        /// An image was processed and its markers applied.
        Confirmed => "confirmed",
    }
}

text_enum! {
    /// Why an image was attached to a waypoint.
    UploadPurpose, "upload purpose" {
        /// First image of a pending waypoint.
        Initial => "initial",
        /// New image for a confirmed waypoint.
        Replacement => "replacement",
    }
}

text_enum! {
    /// Who can see a route.
    Visibility, "visibility" {
        /// Only the owner.
        Private => "private",
        /// Anyone with the link.
        Unlisted => "unlisted",
        /// Listed publicly.
        Public => "public",
    }
}

text_enum! {
    /// How a visible route is opened.
    AccessMethod, "access method" {
        /// No restriction.
        Open => "open",
        /// Requires a passcode.
        Passcode => "passcode",
        /// Requires an invitation.
        Invite => "invite",
    }
}

text_enum! {
    /// How long a route lives.
    LifecycleType, "lifecycle type" {
        /// Kept until deleted.
        Permanent => "permanent",
        /// Removed by its owner after an event.
        Temporary => "temporary",
    }
}

impl Default for Visibility {
    fn default() -> Self {
        Visibility::Private
    }
}

impl Default for AccessMethod {
    fn default() -> Self {
        AccessMethod::Open
    }
}

impl Default for LifecycleType {
    fn default() -> Self {
        LifecycleType::Permanent
    }
}

/// Marker position on a waypoint image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    /// Horizontal position.
    pub x: f64,
    /// Vertical position.
    pub y: f64,
}

impl Marker {
    /// Create a marker.
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Validate a marker supplied by a client: finite and within `0..=1`.
    pub fn validate(&self) -> Result<(), String> {
        for (axis, value) in [("x", self.x), ("y", self.y)] {
            if !value.is_finite() {
                return Err(format!("marker {} is not a finite number", axis));
            }
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("marker {} = {} is outside 0..=1", axis, value));
            }
        }
        Ok(())
    }
}

/// Whether uploads of `content_type` are accepted.
pub fn is_allowed_content_type(content_type: &str) -> bool {
    let content_type = content_type.trim().to_ascii_lowercase();
    ALLOWED_CONTENT_TYPES.contains(&content_type.as_str())
}
