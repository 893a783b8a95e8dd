//! Small fixed-size vector and rotation helpers.
//!
//! Matrices use column-major storage:
//! `[m00, m10, m20, m01, m11, m21, m02, m12, m22]`.

use serde::{Deserialize, Serialize};

pub type Vec3 = [f64; 3];
pub type Mat3 = [f64; 9];

pub const IDENTITY3: Mat3 = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

#[inline]
pub fn dot3(a: Vec3, b: Vec3) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub fn norm3(v: Vec3) -> f64 {
    dot3(v, v).sqrt()
}

#[inline]
pub fn add3(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

#[inline]
pub fn scale3(v: Vec3, s: f64) -> Vec3 {
    [v[0] * s, v[1] * s, v[2] * s]
}

/// Transform a 3D vector by a column-major 3x3 matrix.
#[inline]
pub fn mat3_transform(m: Mat3, v: Vec3) -> Vec3 {
    [
        m[0] * v[0] + m[3] * v[1] + m[6] * v[2],
        m[1] * v[0] + m[4] * v[1] + m[7] * v[2],
        m[2] * v[0] + m[5] * v[1] + m[8] * v[2],
    ]
}

/// Axis/angle rotation described by three angles in degrees.
///
/// The axis is given in spherical coordinates (`inclination` from +z,
/// `azimuth` from +x in the xy-plane) and `angle` is the right-handed
/// rotation about it. All-zero angles mean "no rotation".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisRotation {
    #[serde(default)]
    pub angle: f64,
    #[serde(default)]
    pub inclination: f64,
    #[serde(default)]
    pub azimuth: f64,
}

impl AxisRotation {
    pub fn is_identity(&self) -> bool {
        self.angle == 0.0
    }

    /// Rodrigues rotation matrix, column-major.
    ///
    /// Entries below `1e-10` in magnitude are flushed to zero so that
    /// quarter turns map gradient axes exactly onto each other.
    pub fn matrix(&self) -> Mat3 {
        if self.is_identity() {
            return IDENTITY3;
        }
        let theta = self.inclination.to_radians();
        let phi = self.azimuth.to_radians();
        let alpha = self.angle.to_radians();

        let (ux, uy, uz) = (theta.sin() * phi.cos(), theta.sin() * phi.sin(), theta.cos());
        let c0 = alpha.cos();
        let c = 1.0 - c0;
        let s = alpha.sin();

        let mut m = [
            c0 + ux * ux * c,
            uy * ux * c + uz * s,
            uz * ux * c - uy * s,
            ux * uy * c - uz * s,
            c0 + uy * uy * c,
            uz * uy * c + ux * s,
            ux * uz * c + uy * s,
            uy * uz * c - ux * s,
            c0 + uz * uz * c,
        ];
        for entry in &mut m {
            if entry.abs() < 1.0e-10 {
                *entry = 0.0;
            }
        }
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_rotation_is_identity_matrix() {
        assert_eq!(AxisRotation::default().matrix(), IDENTITY3);
    }

    #[test]
    fn test_quarter_turn_about_z_maps_x_to_y() {
        let rot = AxisRotation {
            angle: 90.0,
            inclination: 0.0,
            azimuth: 0.0,
        };
        let v = mat3_transform(rot.matrix(), [1.0, 0.0, 0.0]);
        assert_eq!(v, [0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_rotation_preserves_length() {
        let rot = AxisRotation {
            angle: 37.0,
            inclination: 55.0,
            azimuth: 120.0,
        };
        let v = [0.3, -1.2, 2.0];
        let r = mat3_transform(rot.matrix(), v);
        assert!((norm3(v) - norm3(r)).abs() < 1e-12);
    }

    #[test]
    fn test_vector_helpers() {
        assert_eq!(dot3([1.0, 2.0, 3.0], [4.0, 5.0, 6.0]), 32.0);
        assert_eq!(add3([1.0, 2.0, 3.0], scale3([1.0, 1.0, 1.0], 2.0)), [3.0, 4.0, 5.0]);
    }
}
