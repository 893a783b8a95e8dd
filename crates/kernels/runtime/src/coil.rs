//! Receive coils.
//!
//! A coil weighs the transverse magnetization of a spin by a complex
//! sensitivity `magnitude * exp(i * phase)` that depends on position only.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use larmor_foundation::{Fingerprint, Vec3};

/// Complex receive sensitivity at a position: `(magnitude, phase in rad)`.
pub trait ReceiveCoil: Debug + Send + Sync {
    fn sensitivity(&self, position: Vec3) -> (f64, f64);

    /// Fold the coil's kind and parameters into a run fingerprint.
    fn fingerprint(&self, fp: Fingerprint) -> Fingerprint;
}

/// Unit sensitivity everywhere.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IdealCoil;

impl ReceiveCoil for IdealCoil {
    fn sensitivity(&self, _position: Vec3) -> (f64, f64) {
        (1.0, 0.0)
    }

    fn fingerprint(&self, fp: Fingerprint) -> Fingerprint {
        fp.str("ideal")
    }
}

/// Spatially constant sensitivity with a fixed phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UniformCoil {
    pub magnitude: f64,
    /// Degrees.
    #[serde(default)]
    pub phase: f64,
}

impl ReceiveCoil for UniformCoil {
    fn sensitivity(&self, _position: Vec3) -> (f64, f64) {
        (self.magnitude, self.phase.to_radians())
    }

    fn fingerprint(&self, fp: Fingerprint) -> Fingerprint {
        fp.str("uniform").f64(self.magnitude).f64(self.phase)
    }
}

/// Surface-coil approximation: Gaussian fall-off around a centre.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaussianCoil {
    pub center: Vec3,
    /// Fall-off width (mm).
    pub width: f64,
    pub magnitude: f64,
    #[serde(default)]
    pub phase: f64,
}

impl ReceiveCoil for GaussianCoil {
    fn sensitivity(&self, position: Vec3) -> (f64, f64) {
        let d2: f64 = (0..3).map(|i| (position[i] - self.center[i]).powi(2)).sum();
        let falloff = (-d2 / (2.0 * self.width * self.width)).exp();
        (self.magnitude * falloff, self.phase.to_radians())
    }

    fn fingerprint(&self, fp: Fingerprint) -> Fingerprint {
        fp.str("gaussian")
            .f64_slice(&self.center)
            .f64(self.width)
            .f64(self.magnitude)
            .f64(self.phase)
    }
}

/// Scenario form of a coil.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CoilSpec {
    Ideal,
    Uniform(UniformCoil),
    Gaussian(GaussianCoil),
}

impl CoilSpec {
    pub fn build(&self) -> Box<dyn ReceiveCoil> {
        match self {
            CoilSpec::Ideal => Box::new(IdealCoil),
            CoilSpec::Uniform(coil) => Box::new(*coil),
            CoilSpec::Gaussian(coil) => Box::new(*coil),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gaussian_coil_decays_with_distance() {
        let coil = GaussianCoil {
            center: [0.0, 0.0, 10.0],
            width: 5.0,
            magnitude: 2.0,
            phase: 90.0,
        };
        let (near, phase) = coil.sensitivity([0.0, 0.0, 10.0]);
        let (far, _) = coil.sensitivity([0.0, 0.0, 0.0]);
        assert_eq!(near, 2.0);
        assert!(far < near);
        assert!((phase - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
    }

    #[test]
    fn test_coil_spec_from_yaml() {
        let coils: Vec<CoilSpec> =
            serde_yaml::from_str("- type: ideal\n- type: uniform\n  magnitude: 0.5\n").unwrap();
        assert_eq!(coils[0].build().sensitivity([1.0; 3]), (1.0, 0.0));
        assert_eq!(coils[1].build().sensitivity([1.0; 3]), (0.5, 0.0));
    }

    #[test]
    fn test_fingerprint_separates_kinds_and_parameters() {
        let hash = |coil: &dyn ReceiveCoil| coil.fingerprint(Fingerprint::new()).finish();
        let ideal = hash(&IdealCoil);
        let unit = hash(&UniformCoil {
            magnitude: 1.0,
            phase: 0.0,
        });
        let double = hash(&UniformCoil {
            magnitude: 2.0,
            phase: 0.0,
        });
        assert_ne!(ideal, unit);
        assert_ne!(unit, double);
        assert_eq!(ideal, hash(&IdealCoil));
    }
}
