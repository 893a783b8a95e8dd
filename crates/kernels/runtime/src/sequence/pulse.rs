//! Leaf payload: one pulse segment with simultaneous RF, gradient and ADC channels.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::tpoi::{SampleSlot, Tpoi, TpoiTag};
use crate::types::{FieldSample, TIME_EPSILON};

use super::counters::{PhaseCycling, RepetitionCounters, RepetitionScaling};
use super::shape::{PulseShape, Shape};

/// Instantaneous RF phase jump at a local time.
///
/// The waveform is discontinuous there, so the leaf reports a
/// discontinuity time point and the integrator restarts at it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseStep {
    /// Local time of the jump.
    pub at: f64,
    /// Phase (degrees) added from `at` onwards, replacing earlier steps.
    pub phase: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfChannel {
    pub shape: Shape,
    /// Initial phase in degrees.
    pub phase: f64,
    /// Carrier offset from the rotating frame (rad/ms).
    pub frequency_offset: f64,
    pub phase_steps: Vec<PhaseStep>,
    pub scaling: Option<RepetitionScaling>,
    pub cycling: Option<PhaseCycling>,
}

impl RfChannel {
    pub fn new(shape: Shape) -> Self {
        Self {
            shape,
            phase: 0.0,
            frequency_offset: 0.0,
            phase_steps: Vec::new(),
            scaling: None,
            cycling: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientChannel {
    pub shape: Shape,
    pub scaling: Option<RepetitionScaling>,
}

impl GradientChannel {
    pub fn new(shape: Shape) -> Self {
        Self {
            shape,
            scaling: None,
        }
    }
}

/// Where the ADC samples fall inside the leaf.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SamplePlacement {
    /// `(i + 1/2) * T / N`: dwell-centred samples.
    #[default]
    Centered,
    /// `(i + 1) * T / N`: last sample on the leaf end.
    Trailing,
    /// Explicit local times, strictly increasing.
    Explicit(Vec<f64>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adc {
    pub samples: u32,
    /// Receiver phase in degrees.
    pub phase: f64,
    pub placement: SamplePlacement,
    pub cycling: Option<PhaseCycling>,
}

impl Adc {
    pub fn new(samples: u32) -> Self {
        Self {
            samples,
            phase: 0.0,
            placement: SamplePlacement::Centered,
            cycling: None,
        }
    }

    fn times(&self, duration: f64) -> Vec<f64> {
        let n = self.samples as usize;
        let dwell = duration / n.max(1) as f64;
        match &self.placement {
            SamplePlacement::Centered => (0..n).map(|i| (i as f64 + 0.5) * dwell).collect(),
            SamplePlacement::Trailing => (0..n).map(|i| (i as f64 + 1.0) * dwell).collect(),
            SamplePlacement::Explicit(times) => times.clone(),
        }
    }
}

/// A pulse segment. All channels play simultaneously for `duration`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Pulse {
    pub duration: f64,
    pub rf: Option<RfChannel>,
    pub gradients: [Option<GradientChannel>; 3],
    pub adc: Option<Adc>,
}

impl Pulse {
    /// A pulse that plays nothing; free precession and relaxation only.
    pub fn delay(duration: f64) -> Self {
        Self {
            duration,
            ..Default::default()
        }
    }

    pub fn with_rf(mut self, rf: RfChannel) -> Self {
        self.rf = Some(rf);
        self
    }

    pub fn with_gradient(mut self, axis: usize, gradient: GradientChannel) -> Self {
        self.gradients[axis] = Some(gradient);
        self
    }

    pub fn with_adc(mut self, adc: Adc) -> Self {
        self.adc = Some(adc);
        self
    }

    pub fn num_samples(&self) -> u64 {
        self.adc.as_ref().map_or(0, |adc| u64::from(adc.samples))
    }

    /// Whether the sample phases (and so the time point list) change with
    /// the repetition counters.
    pub fn tpois_depend_on_counters(&self) -> bool {
        self.adc.as_ref().is_some_and(|adc| adc.cycling.is_some())
    }

    pub(crate) fn loop_references(&self) -> impl Iterator<Item = crate::types::NodeId> + '_ {
        let rf = self.rf.iter().flat_map(|rf| {
            rf.scaling
                .map(|s| s.node)
                .into_iter()
                .chain(rf.cycling.map(|c| c.node))
        });
        let grads = self
            .gradients
            .iter()
            .flatten()
            .filter_map(|g| g.scaling.map(|s| s.node));
        let adc = self
            .adc
            .iter()
            .filter_map(|adc| adc.cycling.map(|c| c.node));
        rf.chain(grads).chain(adc)
    }

    pub(crate) fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let shape_error = |reason: String| ConfigError::InvalidShape {
            leaf: name.to_string(),
            reason,
        };
        if let Some(rf) = &self.rf {
            rf.shape.validate(self.duration).map_err(shape_error)?;
            if rf.phase_steps.windows(2).any(|w| w[1].at <= w[0].at) {
                return Err(shape_error("phase steps must be strictly increasing".into()));
            }
        }
        for gradient in self.gradients.iter().flatten() {
            gradient.shape.validate(self.duration).map_err(shape_error)?;
        }
        if let Some(adc) = &self.adc
            && let SamplePlacement::Explicit(times) = &adc.placement
            && times.len() != adc.samples as usize
        {
            return Err(shape_error(format!(
                "ADC declares {} samples but lists {} times",
                adc.samples,
                times.len()
            )));
        }
        Ok(())
    }

    /// Time points of this leaf in local time.
    ///
    /// Markers at both ends, one sample per ADC point and one discontinuity
    /// per declared phase jump.
    pub fn tpois(&self, name: &str, counters: &RepetitionCounters) -> Result<Vec<Tpoi>, ConfigError> {
        let mut points = vec![Tpoi::marker(0.0), Tpoi::marker(self.duration)];

        if let Some(adc) = &self.adc {
            let phase = adc.phase.to_radians()
                + adc.cycling.map_or(0.0, |cycling| cycling.offset(counters));
            for (ordinal, time) in adc.times(self.duration).into_iter().enumerate() {
                points.push(Tpoi {
                    time,
                    tag: TpoiTag::Sample(SampleSlot {
                        ordinal: ordinal as u32,
                        receiver_phase: phase,
                    }),
                });
            }
        }
        if let Some(rf) = &self.rf {
            points.extend(rf.phase_steps.iter().map(|step| Tpoi::discontinuity(step.at)));
        }

        for point in &points {
            if !(point.time >= -TIME_EPSILON && point.time <= self.duration + TIME_EPSILON) {
                return Err(ConfigError::TimePointOutOfRange {
                    leaf: name.to_string(),
                    time: point.time,
                    duration: self.duration,
                });
            }
        }
        Ok(points)
    }

    /// Bind the repetition-dependent parameters for one block visit.
    pub fn resolve(&self, counters: &RepetitionCounters) -> ResolvedPulse<'_> {
        let (rf_scale, rf_phase) = self.rf.as_ref().map_or((0.0, 0.0), |rf| {
            (
                rf.scaling.map_or(1.0, |s| s.factor(counters)),
                rf.phase.to_radians() + rf.cycling.map_or(0.0, |c| c.offset(counters)),
            )
        });
        let grad_scale = std::array::from_fn(|axis| {
            self.gradients[axis]
                .as_ref()
                .and_then(|g| g.scaling)
                .map_or(1.0, |s| s.factor(counters))
        });
        ResolvedPulse {
            pulse: self,
            rf_scale,
            rf_phase,
            grad_scale,
        }
    }
}

/// A pulse with its repetition counters applied.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedPulse<'a> {
    pulse: &'a Pulse,
    rf_scale: f64,
    rf_phase: f64,
    grad_scale: [f64; 3],
}

impl ResolvedPulse<'_> {
    pub fn duration(&self) -> f64 {
        self.pulse.duration
    }

    /// Field at local time `t`.
    ///
    /// `anchor` is the local time of the last integrator restart; phase
    /// steps at or before it are in effect. Steps after it cannot be
    /// reached without another restart.
    pub fn field_at(&self, t: f64, anchor: f64) -> FieldSample {
        let duration = self.pulse.duration;
        let t = t.clamp(0.0, duration);

        let (rf_amplitude, rf_phase) = match &self.pulse.rf {
            Some(rf) => {
                let step = rf
                    .phase_steps
                    .iter()
                    .filter(|step| step.at <= anchor + TIME_EPSILON)
                    .next_back()
                    .map_or(0.0, |step| step.phase.to_radians());
                (
                    self.rf_scale * rf.shape.magnitude_at(t, duration),
                    self.rf_phase + step + rf.shape.phase_at(t, duration) + rf.frequency_offset * t,
                )
            }
            None => (0.0, 0.0),
        };

        let gradient = std::array::from_fn(|axis| {
            self.pulse.gradients[axis]
                .as_ref()
                .map_or(0.0, |g| self.grad_scale[axis] * g.shape.magnitude_at(t, duration))
        });

        FieldSample {
            rf_amplitude,
            rf_phase,
            gradient,
        }
    }
}
