//! Dormand-Prince 5(4) stepper with adaptive step control.
//!
//! Explicit, seven stages with first-same-as-last reuse. Accepted steps
//! never cross the caller's hard stop, so a waveform discontinuity placed
//! there is never integrated over. Values between two accepted points come
//! from cubic Hermite interpolation of the step end points and slopes.

use crate::error::IntegrationFailure;
use crate::types::TIME_EPSILON;

use super::tolerance::Tolerances;

/// A first-order system `dy/dt = f(t, y)`.
pub trait OdeSystem {
    fn dimension(&self) -> usize;
    fn derivative(&self, t: f64, y: &[f64], dy: &mut [f64]);
}

// ============================================================================
// Butcher tableau
// ============================================================================

const C2: f64 = 1.0 / 5.0;
const C3: f64 = 3.0 / 10.0;
const C4: f64 = 4.0 / 5.0;
const C5: f64 = 8.0 / 9.0;

const A21: f64 = 1.0 / 5.0;
const A31: f64 = 3.0 / 40.0;
const A32: f64 = 9.0 / 40.0;
const A41: f64 = 44.0 / 45.0;
const A42: f64 = -56.0 / 15.0;
const A43: f64 = 32.0 / 9.0;
const A51: f64 = 19372.0 / 6561.0;
const A52: f64 = -25360.0 / 2187.0;
const A53: f64 = 64448.0 / 6561.0;
const A54: f64 = -212.0 / 729.0;
const A61: f64 = 9017.0 / 3168.0;
const A62: f64 = -355.0 / 33.0;
const A63: f64 = 46732.0 / 5247.0;
const A64: f64 = 49.0 / 176.0;
const A65: f64 = -5103.0 / 18656.0;
const A71: f64 = 35.0 / 384.0;
const A73: f64 = 500.0 / 1113.0;
const A74: f64 = 125.0 / 192.0;
const A75: f64 = -2187.0 / 6784.0;
const A76: f64 = 11.0 / 84.0;

// difference between the 5th and embedded 4th order weights
const E1: f64 = 71.0 / 57600.0;
const E3: f64 = -71.0 / 16695.0;
const E4: f64 = 71.0 / 1920.0;
const E5: f64 = -17253.0 / 339200.0;
const E6: f64 = 22.0 / 525.0;
const E7: f64 = -1.0 / 40.0;

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;
const NON_FINITE_FACTOR: f64 = 0.25;
const MIN_RELATIVE_STEP: f64 = 1.0e-12;

/// Adaptive integrator state between two restarts.
#[derive(Debug, Clone)]
pub struct DormandPrince {
    rtol: f64,
    atol: Vec<f64>,
    max_steps: usize,
    max_step: Option<f64>,

    t: f64,
    y: Vec<f64>,
    f: Vec<f64>,
    t_prev: f64,
    y_prev: Vec<f64>,
    f_prev: Vec<f64>,

    /// Next proposed step; 0 until the first step after a restart.
    h: f64,
    rejected_last: bool,
    steps: usize,

    k: [Vec<f64>; 6],
    y_stage: Vec<f64>,
    y_next: Vec<f64>,
}

impl DormandPrince {
    /// Stepper for a system of `atol.len()` components.
    pub fn new(tolerances: &Tolerances, atol: Vec<f64>) -> Self {
        let n = atol.len();
        Self {
            rtol: tolerances.rtol,
            atol,
            max_steps: tolerances.max_steps,
            max_step: tolerances.max_step(),
            t: 0.0,
            y: vec![0.0; n],
            f: vec![0.0; n],
            t_prev: 0.0,
            y_prev: vec![0.0; n],
            f_prev: vec![0.0; n],
            h: 0.0,
            rejected_last: false,
            steps: 0,
            k: std::array::from_fn(|_| vec![0.0; n]),
            y_stage: vec![0.0; n],
            y_next: vec![0.0; n],
        }
    }

    pub fn time(&self) -> f64 {
        self.t
    }

    pub fn state(&self) -> &[f64] {
        &self.y
    }

    /// Attempted steps since construction, rejected ones included.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Drop the step history and continue from `(t, y)`.
    ///
    /// The step size is re-estimated on the next step since the field on
    /// the far side of a discontinuity has nothing to do with the old one.
    pub fn restart<S: OdeSystem>(
        &mut self,
        system: &S,
        t: f64,
        y: &[f64],
    ) -> Result<(), IntegrationFailure> {
        debug_assert_eq!(y.len(), system.dimension());
        self.t = t;
        self.y.copy_from_slice(y);
        system.derivative(t, &self.y, &mut self.f);
        if !all_finite(&self.y) || !all_finite(&self.f) {
            return Err(IntegrationFailure::NonFinite { time: t });
        }
        self.t_prev = t;
        self.y_prev.copy_from_slice(&self.y);
        self.f_prev.copy_from_slice(&self.f);
        self.h = 0.0;
        self.rejected_last = false;
        Ok(())
    }

    /// Write the solution at `target` into `out`.
    ///
    /// Steps forward as needed without ever passing `hard_stop`. A target
    /// inside the last accepted step is interpolated.
    pub fn advance<S: OdeSystem>(
        &mut self,
        system: &S,
        target: f64,
        hard_stop: f64,
        out: &mut [f64],
    ) -> Result<(), IntegrationFailure> {
        if target < self.t_prev - TIME_EPSILON {
            return Err(IntegrationFailure::Backwards {
                from: self.t_prev,
                to: target,
            });
        }
        let hard_stop = hard_stop.max(target);

        while self.t < target - TIME_EPSILON {
            self.step(system, hard_stop)?;
        }

        if (target - self.t).abs() <= TIME_EPSILON || self.t <= self.t_prev {
            out.copy_from_slice(&self.y);
        } else {
            self.interpolate(target, out);
        }
        Ok(())
    }

    fn interpolate(&self, target: f64, out: &mut [f64]) {
        let h = self.t - self.t_prev;
        let theta = ((target - self.t_prev) / h).clamp(0.0, 1.0);
        for i in 0..out.len() {
            let (y0, y1) = (self.y_prev[i], self.y[i]);
            let dy = y1 - y0;
            out[i] = y0
                + theta * dy
                + theta
                    * (theta - 1.0)
                    * ((1.0 - 2.0 * theta) * dy
                        + (theta - 1.0) * h * self.f_prev[i]
                        + theta * h * self.f[i]);
        }
    }

    /// Take one accepted step, retrying rejected attempts internally.
    fn step<S: OdeSystem>(&mut self, system: &S, hard_stop: f64) -> Result<(), IntegrationFailure> {
        if self.h <= 0.0 {
            self.h = self.initial_step(system, hard_stop);
        }

        loop {
            if self.steps >= self.max_steps {
                return Err(IntegrationFailure::StepBudgetExhausted {
                    time: self.t,
                    steps: self.steps,
                });
            }

            let natural = match self.max_step {
                Some(limit) => self.h.min(limit),
                None => self.h,
            };
            let remaining = hard_stop - self.t;
            // avoid leaving a sliver in front of the stop
            let clipped = self.t + 1.01 * natural >= hard_stop;
            let h = if clipped { remaining } else { natural };

            if h < MIN_RELATIVE_STEP * self.t.abs().max(1.0) {
                return Err(IntegrationFailure::StepUnderflow {
                    time: self.t,
                    step: h,
                });
            }

            self.steps += 1;
            self.trial(system, h);

            let finite = all_finite(&self.y_next) && all_finite(&self.k[5]);
            if !finite {
                self.h = h * NON_FINITE_FACTOR;
                self.rejected_last = true;
                continue;
            }

            let err = self.error_norm(h);
            if err <= 1.0 {
                let mut factor = if err == 0.0 {
                    MAX_FACTOR
                } else {
                    (SAFETY * err.powf(-0.2)).clamp(MIN_FACTOR, MAX_FACTOR)
                };
                if self.rejected_last {
                    factor = factor.min(1.0);
                }

                self.t_prev = self.t;
                std::mem::swap(&mut self.y_prev, &mut self.y);
                std::mem::swap(&mut self.f_prev, &mut self.f);
                self.t = if clipped { hard_stop } else { self.t + h };
                std::mem::swap(&mut self.y, &mut self.y_next);
                std::mem::swap(&mut self.f, &mut self.k[5]);

                // a step shortened by the stop says nothing about the
                // natural scale; keep the unclipped proposal
                self.h = if clipped { natural.max(h * factor) } else { h * factor };
                self.rejected_last = false;
                return Ok(());
            }

            let factor = (SAFETY * err.powf(-0.2)).max(MIN_FACTOR);
            self.h = h * factor;
            self.rejected_last = true;
        }
    }

    /// Compute stages 2..7 for step `h`; result in `y_next`, last slope in `k[5]`.
    fn trial<S: OdeSystem>(&mut self, system: &S, h: f64) {
        let n = self.y.len();
        let (t, y, k1) = (self.t, &self.y, &self.f);
        let [k2, k3, k4, k5, k6, k7] = &mut self.k;
        let ys = &mut self.y_stage;

        for i in 0..n {
            ys[i] = y[i] + h * A21 * k1[i];
        }
        system.derivative(t + C2 * h, ys, k2);

        for i in 0..n {
            ys[i] = y[i] + h * (A31 * k1[i] + A32 * k2[i]);
        }
        system.derivative(t + C3 * h, ys, k3);

        for i in 0..n {
            ys[i] = y[i] + h * (A41 * k1[i] + A42 * k2[i] + A43 * k3[i]);
        }
        system.derivative(t + C4 * h, ys, k4);

        for i in 0..n {
            ys[i] = y[i] + h * (A51 * k1[i] + A52 * k2[i] + A53 * k3[i] + A54 * k4[i]);
        }
        system.derivative(t + C5 * h, ys, k5);

        for i in 0..n {
            ys[i] = y[i]
                + h * (A61 * k1[i] + A62 * k2[i] + A63 * k3[i] + A64 * k4[i] + A65 * k5[i]);
        }
        system.derivative(t + h, ys, k6);

        let next = &mut self.y_next;
        for i in 0..n {
            next[i] = y[i]
                + h * (A71 * k1[i] + A73 * k3[i] + A74 * k4[i] + A75 * k5[i] + A76 * k6[i]);
        }
        system.derivative(t + h, next, k7);
    }

    /// RMS of the local error estimate scaled by the per-component tolerance.
    fn error_norm(&self, h: f64) -> f64 {
        let [_, k3, k4, k5, k6, k7] = &self.k;
        let n = self.y.len();
        let mut sum = 0.0;
        for i in 0..n {
            let err = h
                * (E1 * self.f[i] + E3 * k3[i] + E4 * k4[i] + E5 * k5[i] + E6 * k6[i] + E7 * k7[i]);
            let scale = self.atol[i] + self.rtol * self.y[i].abs().max(self.y_next[i].abs());
            sum += (err / scale).powi(2);
        }
        (sum / n.max(1) as f64).sqrt()
    }

    /// Starting step from the size of the state and its first two derivatives.
    fn initial_step<S: OdeSystem>(&self, system: &S, hard_stop: f64) -> f64 {
        let span = (hard_stop - self.t).max(0.0);
        let n = self.y.len();
        let scale = |i: usize, y: &[f64]| self.atol[i] + self.rtol * y[i].abs();

        let rms = |v: &[f64], y: &[f64]| {
            let sum: f64 = (0..n).map(|i| (v[i] / scale(i, y)).powi(2)).sum();
            (sum / n.max(1) as f64).sqrt()
        };
        let d0 = rms(&self.y, &self.y);
        let d1 = rms(&self.f, &self.y);

        let mut h0 = if d0 < 1.0e-5 || d1 < 1.0e-5 {
            1.0e-6
        } else {
            0.01 * d0 / d1
        };
        h0 = h0.min(span);

        let mut probe = vec![0.0; n];
        let mut slope = vec![0.0; n];
        for i in 0..n {
            probe[i] = self.y[i] + h0 * self.f[i];
        }
        system.derivative(self.t + h0, &probe, &mut slope);
        for i in 0..n {
            slope[i] -= self.f[i];
        }
        let d2 = if h0 > 0.0 { rms(&slope, &self.y) / h0 } else { 0.0 };

        let dmax = d1.max(d2);
        let h1 = if dmax <= 1.0e-15 || !dmax.is_finite() {
            (h0 * 1.0e-3).max(1.0e-6)
        } else {
            (0.01 / dmax).powf(0.2)
        };
        let h = (100.0 * h0).min(h1).min(span);
        match self.max_step {
            Some(limit) => h.min(limit),
            None => h,
        }
    }
}

fn all_finite(values: &[f64]) -> bool {
    values.iter().all(|v| v.is_finite())
}
