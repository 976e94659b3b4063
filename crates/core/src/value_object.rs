//! Value objects: equal by value, immutable once built.

use serde::{Deserialize, Serialize};

/// Marker trait for value objects.
///
/// To "modify" one, build a new value.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}

/// An integer held in `[0, 100]`.
///
/// Construction and arithmetic saturate at the bounds instead of failing, so an
/// oversized penalty or bonus can never push a score out of range.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub struct Bounded100(u8);

impl Bounded100 {
    pub const MIN: Self = Self(0);
    pub const MAX: Self = Self(100);

    pub fn new(value: i64) -> Self {
        Self(value.clamp(0, 100) as u8)
    }

    pub fn get(self) -> i64 {
        i64::from(self.0)
    }

    /// Add a signed delta, clamping the result.
    pub fn offset(self, delta: i64) -> Self {
        Self::new(self.get().saturating_add(delta))
    }
}

impl ValueObject for Bounded100 {}

impl From<i64> for Bounded100 {
    fn from(value: i64) -> Self {
        Self::new(value)
    }
}

impl From<Bounded100> for i64 {
    fn from(value: Bounded100) -> Self {
        value.get()
    }
}

impl core::fmt::Display for Bounded100 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}
