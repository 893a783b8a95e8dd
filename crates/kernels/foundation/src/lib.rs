//! Larmor Foundation
//!
//! Primitives shared by the Larmor crates: stable hashing for run
//! fingerprints, deterministic RNG streams keyed by spin index, and the
//! handful of 3-vector and rotation helpers the field model needs.

pub mod geometry;
pub mod rng;
pub mod stable_hash;

pub use geometry::{AxisRotation, Mat3, Vec3};
pub use rng::RngStream;
pub use stable_hash::{Fingerprint, fnv1a64, fnv1a64_str};

/// Simulation time in milliseconds.
///
/// Gradients are expressed in rad/(ms * mm) and rates in 1/ms, so every
/// product that enters a phase is dimensionless.
pub type Millis = f64;
