//! Capacity vectors: per-dimension resource amounts.
//!
//! A [`CapacityVector`] carries one non-negative `f64` per tracked resource
//! dimension. The same type is used for VM demand, active (total) capacity,
//! passive (reserved) capacity, and used capacity, so every policy can
//! compare and combine them without unit conversions.

use std::fmt;
use std::ops::Index;

use serde::{Deserialize, Serialize};

/// CPU dimension index.
pub const CPU: usize = 0;
/// Memory dimension index.
pub const MEMORY: usize = 1;
/// Network receive dimension index.
pub const NETWORK_RX: usize = 2;
/// Network transmit dimension index.
pub const NETWORK_TX: usize = 3;
/// Number of canonical dimensions.
pub const DIMENSIONS: usize = 4;

/// Tolerance for accumulated floating point error in fit checks.
const EPSILON: f64 = 1e-9;

/// An ordered, non-negative resource vector.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapacityVector(Vec<f64>);

impl CapacityVector {
    /// Build a vector, clamping negative and NaN components to zero.
    pub fn new(values: Vec<f64>) -> Self {
        Self(values.into_iter().map(sanitize).collect())
    }

    /// A zero vector with `dimensions` components.
    pub fn zeros(dimensions: usize) -> Self {
        Self(vec![0.0; dimensions])
    }

    pub fn from_slice(values: &[f64]) -> Self {
        Self::new(values.to_vec())
    }

    pub fn dimensions(&self) -> usize {
        self.0.len()
    }

    pub fn values(&self) -> &[f64] {
        &self.0
    }

    /// Component `i`, or 0.0 when the vector has fewer dimensions.
    pub fn get(&self, i: usize) -> f64 {
        self.0.get(i).copied().unwrap_or(0.0)
    }

    /// Sum of absolute component values.
    pub fn l1_norm(&self) -> f64 {
        self.0.iter().map(|v| v.abs()).sum()
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|v| *v == 0.0)
    }

    /// Component-wise sum. Missing components count as zero.
    pub fn add(&self, other: &CapacityVector) -> CapacityVector {
        let len = self.dimensions().max(other.dimensions());
        Self((0..len).map(|i| self.get(i) + other.get(i)).collect())
    }

    /// In-place component-wise sum.
    pub fn accumulate(&mut self, other: &CapacityVector) {
        if other.dimensions() > self.dimensions() {
            self.0.resize(other.dimensions(), 0.0);
        }
        for (i, v) in self.0.iter_mut().enumerate() {
            *v += other.get(i);
        }
    }

    /// Component-wise difference clamped at zero.
    pub fn saturating_sub(&self, other: &CapacityVector) -> CapacityVector {
        let len = self.dimensions().max(other.dimensions());
        Self(
            (0..len)
                .map(|i| (self.get(i) - other.get(i)).max(0.0))
                .collect(),
        )
    }

    /// Multiply every component by `factor` (negative factors yield zero).
    pub fn scale(&self, factor: f64) -> CapacityVector {
        Self::new(self.0.iter().map(|v| v * factor).collect())
    }

    /// Whether `self[i] <= capacity[i]` for every dimension.
    ///
    /// Vectors of different dimensionality never fit.
    pub fn fits_within(&self, capacity: &CapacityVector) -> bool {
        if self.dimensions() != capacity.dimensions() {
            return false;
        }
        self.0
            .iter()
            .zip(capacity.0.iter())
            .all(|(demand, free)| *demand <= *free + EPSILON)
    }

    /// Per-dimension ratio `self[i] / total[i]`.
    ///
    /// A zero total yields 0.0 for a zero numerator and infinity otherwise.
    pub fn ratio_to(&self, total: &CapacityVector) -> CapacityVector {
        let len = self.dimensions().max(total.dimensions());
        Self(
            (0..len)
                .map(|i| {
                    let (used, cap) = (self.get(i), total.get(i));
                    if cap > 0.0 {
                        used / cap
                    } else if used > 0.0 {
                        f64::INFINITY
                    } else {
                        0.0
                    }
                })
                .collect(),
        )
    }
}

impl CapacityVector {
    /// Whether `self[i] / total[i]` is above `limit(i)` in any dimension.
    pub fn exceeds_ratio(&self, total: &CapacityVector, limit: impl Fn(usize) -> f64) -> bool {
        self.ratio_to(total)
            .values()
            .iter()
            .enumerate()
            .any(|(i, r)| *r > limit(i) + EPSILON)
    }
}

fn sanitize(v: f64) -> f64 {
    if v.is_nan() || v < 0.0 { 0.0 } else { v }
}

impl Index<usize> for CapacityVector {
    type Output = f64;

    fn index(&self, index: usize) -> &f64 {
        &self.0[index]
    }
}

impl From<Vec<f64>> for CapacityVector {
    fn from(values: Vec<f64>) -> Self {
        Self::new(values)
    }
}

impl fmt::Display for CapacityVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v:.2}")?;
        }
        write!(f, "]")
    }
}
