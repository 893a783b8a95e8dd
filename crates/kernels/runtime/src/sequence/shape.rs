//! Pulse envelopes.
//!
//! Every waveform a leaf plays (RF envelope or gradient lobe) implements the
//! closed [`PulseShape`] capability. The scheduling core never inspects which
//! variant it holds; it only asks for magnitude and phase at a local time.
//!
//! Local time runs over `[0, duration]` of the owning leaf. Shapes are
//! evaluated outside that interval only through clamping by the caller.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

/// Magnitude and phase of a waveform at a local time.
pub trait PulseShape {
    /// Envelope magnitude at local time `t` of a leaf lasting `duration`.
    fn magnitude_at(&self, t: f64, duration: f64) -> f64;

    /// Phase modulation (rad) at local time `t`. Most envelopes are real.
    fn phase_at(&self, _t: f64, _duration: f64) -> f64 {
        0.0
    }

    /// Check the parameters once at build time.
    fn validate(&self, duration: f64) -> Result<(), String>;
}

/// Constant amplitude for the whole leaf (hard pulse, flat gradient).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Constant {
    pub amplitude: f64,
}

impl PulseShape for Constant {
    fn magnitude_at(&self, _t: f64, _duration: f64) -> f64 {
        self.amplitude
    }

    fn validate(&self, _duration: f64) -> Result<(), String> {
        finite("amplitude", self.amplitude)
    }
}

/// Hard pulse given by its flip angle instead of an amplitude.
///
/// The amplitude follows from the leaf duration so that the integral of the
/// envelope equals the flip angle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rect {
    /// Flip angle in degrees.
    pub flip_angle: f64,
}

impl PulseShape for Rect {
    fn magnitude_at(&self, _t: f64, duration: f64) -> f64 {
        if duration > 0.0 {
            self.flip_angle.to_radians() / duration
        } else {
            0.0
        }
    }

    fn validate(&self, duration: f64) -> Result<(), String> {
        finite("flipAngle", self.flip_angle)?;
        if self.flip_angle != 0.0 && duration <= 0.0 {
            return Err("a rect pulse with a flip angle needs a positive duration".into());
        }
        Ok(())
    }
}

/// Apodized sinc with `zeros` zero crossings on each side of the centre.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sinc {
    pub amplitude: f64,
    pub zeros: u32,
    /// Hamming-style apodization weight in `[0, 1]`; 0 disables it.
    #[serde(default)]
    pub apodization: f64,
}

impl PulseShape for Sinc {
    fn magnitude_at(&self, t: f64, duration: f64) -> f64 {
        let half = 0.5 * duration;
        let x = (t - half) / half;
        let arg = PI * f64::from(self.zeros) * x;
        let sinc = if arg.abs() < 1.0e-12 { 1.0 } else { arg.sin() / arg };
        let window = (1.0 - self.apodization) + self.apodization * (PI * x).cos();
        self.amplitude * sinc * window
    }

    fn validate(&self, _duration: f64) -> Result<(), String> {
        finite("amplitude", self.amplitude)?;
        if self.zeros == 0 {
            return Err("sinc needs at least one zero crossing".into());
        }
        if !(0.0..=1.0).contains(&self.apodization) {
            return Err(format!("apodization {} outside [0, 1]", self.apodization));
        }
        Ok(())
    }
}

/// Gaussian envelope centred in the leaf.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gaussian {
    pub amplitude: f64,
    /// Standard deviation as a fraction of the leaf duration.
    pub sigma_fraction: f64,
}

impl PulseShape for Gaussian {
    fn magnitude_at(&self, t: f64, duration: f64) -> f64 {
        let sigma = self.sigma_fraction * duration;
        let x = t - 0.5 * duration;
        self.amplitude * (-(x * x) / (2.0 * sigma * sigma)).exp()
    }

    fn validate(&self, _duration: f64) -> Result<(), String> {
        finite("amplitude", self.amplitude)?;
        if !(self.sigma_fraction > 0.0) {
            return Err("sigmaFraction must be positive".into());
        }
        Ok(())
    }
}

/// Linear ramp up, flat top, linear ramp down.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trapezoid {
    pub amplitude: f64,
    pub ramp_up: f64,
    pub ramp_down: f64,
}

impl PulseShape for Trapezoid {
    fn magnitude_at(&self, t: f64, duration: f64) -> f64 {
        let down_start = duration - self.ramp_down;
        if t < self.ramp_up {
            self.amplitude * t / self.ramp_up
        } else if t > down_start {
            self.amplitude * ((duration - t) / self.ramp_down).max(0.0)
        } else {
            self.amplitude
        }
    }

    fn validate(&self, duration: f64) -> Result<(), String> {
        finite("amplitude", self.amplitude)?;
        if self.ramp_up < 0.0 || self.ramp_down < 0.0 {
            return Err("ramps must be non-negative".into());
        }
        if self.ramp_up + self.ramp_down > duration + f64::EPSILON {
            return Err(format!(
                "ramps ({} + {}) exceed leaf duration {duration}",
                self.ramp_up, self.ramp_down
            ));
        }
        Ok(())
    }
}

/// Hyperbolic secant with frequency sweep (adiabatic inversion).
///
/// `B1(t) = A sech(beta x)`, `phase(t) = mu ln(sech(beta x))` with `x`
/// measured from the leaf centre.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sech {
    pub amplitude: f64,
    pub beta: f64,
    pub mu: f64,
}

impl Sech {
    fn sech(&self, t: f64, duration: f64) -> f64 {
        1.0 / (self.beta * (t - 0.5 * duration)).cosh()
    }
}

impl PulseShape for Sech {
    fn magnitude_at(&self, t: f64, duration: f64) -> f64 {
        self.amplitude * self.sech(t, duration)
    }

    fn phase_at(&self, t: f64, duration: f64) -> f64 {
        self.mu * self.sech(t, duration).ln()
    }

    fn validate(&self, _duration: f64) -> Result<(), String> {
        finite("amplitude", self.amplitude)?;
        finite("beta", self.beta)?;
        finite("mu", self.mu)
    }
}

/// Closed set of envelopes a leaf may carry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Shape {
    Constant(Constant),
    Rect(Rect),
    Sinc(Sinc),
    Gaussian(Gaussian),
    Trapezoid(Trapezoid),
    Sech(Sech),
}

impl Shape {
    pub fn constant(amplitude: f64) -> Self {
        Shape::Constant(Constant { amplitude })
    }

    fn inner(&self) -> &dyn PulseShape {
        match self {
            Shape::Constant(s) => s,
            Shape::Rect(s) => s,
            Shape::Sinc(s) => s,
            Shape::Gaussian(s) => s,
            Shape::Trapezoid(s) => s,
            Shape::Sech(s) => s,
        }
    }
}

impl PulseShape for Shape {
    #[inline]
    fn magnitude_at(&self, t: f64, duration: f64) -> f64 {
        self.inner().magnitude_at(t, duration)
    }

    #[inline]
    fn phase_at(&self, t: f64, duration: f64) -> f64 {
        self.inner().phase_at(t, duration)
    }

    fn validate(&self, duration: f64) -> Result<(), String> {
        self.inner().validate(duration)
    }
}

fn finite(name: &str, value: f64) -> Result<(), String> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(format!("{name} must be finite, got {value}"))
    }
}
