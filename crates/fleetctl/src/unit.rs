//! Core unit types for fleetctl.
//!
//! This module defines the identifiers and coordinates shared by every
//! other part of the fleet controller.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier naming one unit for the lifetime of a fleet session.
///
/// In practice this is a link URI such as `radio://0/80/2M/E7E7E7E701`, but the
/// controller never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitAddress(String);

impl UnitAddress {
    /// Create a new unit address.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Borrow the address as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UnitAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for UnitAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

impl AsRef<str> for UnitAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A point in the flight volume, in meters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
    /// Z coordinate (height above the ground plane).
    pub z: f64,
}

impl Position {
    /// The origin of the flight volume.
    pub const ORIGIN: Self = Self::new(0.0, 0.0, 0.0);

    /// Create a new position.
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Same horizontal coordinates at a different height.
    #[must_use]
    pub const fn with_z(self, z: f64) -> Self {
        Self { z, ..self }
    }

    /// Check that every coordinate is a finite number.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

impl From<(f64, f64, f64)> for Position {
    fn from((x, y, z): (f64, f64, f64)) -> Self {
        Self::new(x, y, z)
    }
}
