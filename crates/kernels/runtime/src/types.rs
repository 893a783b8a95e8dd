//! Core runtime types shared across the engine.
//!
//! # Key Types
//!
//! - [`NodeId`] - Index of a node in the sequence arena
//! - [`Magnetization`] - Cartesian magnetization of every pool of one spin
//! - [`FieldSample`] - Driving field seen by a spin at one instant
//!
//! # Units
//!
//! Time is in milliseconds, positions in millimetres. Fields are expressed
//! directly as angular frequencies: RF amplitude and off-resonance in rad/ms,
//! gradients in rad/(ms*mm). Relaxation and exchange rates are in 1/ms.

use std::fmt;

pub use larmor_foundation::{Millis, Vec3};

use serde::{Deserialize, Serialize};

/// Two time points closer than this are considered the same instant.
pub const TIME_EPSILON: Millis = 1.0e-6;

/// Index of a node in a [`SequenceTree`](crate::sequence::SequenceTree) arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Driving field at one instant, already rotated into the lab frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FieldSample {
    /// RF amplitude (rad/ms).
    pub rf_amplitude: f64,
    /// RF phase (rad).
    pub rf_phase: f64,
    /// Gradient vector (rad/(ms*mm)).
    pub gradient: Vec3,
}

impl FieldSample {
    /// Off-resonance contributed by the gradient at `position`.
    #[inline]
    pub fn gradient_offset(&self, position: Vec3) -> f64 {
        larmor_foundation::geometry::dot3(self.gradient, position)
    }
}

/// Magnetization of all pools of one spin, flattened as `[x0, y0, z0, x1, ...]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Magnetization(Vec<f64>);

impl Magnetization {
    /// Equilibrium state: every pool along +z with its own M0.
    pub fn equilibrium(m0: impl IntoIterator<Item = f64>) -> Self {
        Self(m0.into_iter().flat_map(|m| [0.0, 0.0, m]).collect())
    }

    pub fn from_components(components: Vec<f64>) -> Self {
        debug_assert_eq!(components.len() % 3, 0);
        Self(components)
    }

    pub fn pool_count(&self) -> usize {
        self.0.len() / 3
    }

    pub fn pool(&self, index: usize) -> Vec3 {
        let base = index * 3;
        [self.0[base], self.0[base + 1], self.0[base + 2]]
    }

    /// Sum over pools; what a receive coil sees.
    pub fn total(&self) -> Vec3 {
        self.0.chunks_exact(3).fold([0.0; 3], |acc, m| {
            [acc[0] + m[0], acc[1] + m[1], acc[2] + m[2]]
        })
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.0
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
}
