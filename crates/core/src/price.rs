//! Price value object.

use serde::{Deserialize, Serialize};

use crate::value_object::ValueObject;

/// A price in the smallest currency unit (e.g. cents).
///
/// The catalog is single-currency; marketplaces that need a currency code get
/// it from adapter configuration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(u64);

impl ValueObject for Price {}

impl Price {
    pub const fn from_minor(minor: u64) -> Self {
        Self(minor)
    }

    pub const fn from_major(major: u64) -> Self {
        Self(major * 100)
    }

    pub fn minor(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Relative distance `|a - b| / max(a, b)`, in `[0, 1]`.
    pub fn relative_distance(&self, other: Price) -> f64 {
        let hi = self.0.max(other.0);
        if hi == 0 {
            return 0.0;
        }
        self.0.abs_diff(other.0) as f64 / hi as f64
    }
}

impl core::fmt::Display for Price {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}
