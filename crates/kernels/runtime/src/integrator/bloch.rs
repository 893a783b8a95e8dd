//! Right-hand sides: rotating-frame Bloch and Bloch-McConnell equations.
//!
//! With driving field `B = (Bx, By, Bz)` in rad/ms,
//!
//! ```text
//! dMx/dt =  Bz*My - By*Mz - R2*Mx
//! dMy/dt = -Bz*Mx + Bx*Mz - R2*My
//! dMz/dt =  By*Mx - Bx*My + R1*(M0 - Mz)
//! ```
//!
//! where `Bx + iBy` is the RF field and `Bz` collects gradient, static
//! off-resonance, chemical shift and the concomitant-field correction.

use crate::sample::Pool;
use crate::sequence::{BlockField, FieldWindow};
use crate::trajectory::BlockPath;

use super::dopri::OdeSystem;
use super::exchange::ExchangeMatrix;

/// RF amplitude treated as "off" by the small-signal guard (rad/ms).
pub const RF_EPSILON: f64 = 1.0e-10;

/// Driving field evaluated at one instant, before per-pool shifts.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Drive {
    pub bx: f64,
    pub by: f64,
    pub bz: f64,
    pub rf: f64,
}

/// Everything needed to turn a time into a driving field for one spin.
#[derive(Debug, Clone)]
pub(crate) struct FieldModel<'a> {
    pub block: &'a BlockField<'a>,
    pub window: FieldWindow,
    pub path: &'a BlockPath<'a>,
    pub off_resonance: f64,
    /// Coefficient of the concomitant (Maxwell) term; 0 disables it.
    pub concomitant: f64,
}

impl FieldModel<'_> {
    #[inline]
    pub fn drive(&self, t: f64) -> Drive {
        let field = self.block.field_at(&self.window, t);
        let position = self.path.position(t);
        let mut bz = field.gradient_offset(position) + self.off_resonance;
        if self.concomitant != 0.0 {
            let [gx, gy, gz] = field.gradient;
            let [x, y, z] = position;
            let a = gx * z - 0.5 * gz * x;
            let b = gy * z - 0.5 * gz * y;
            bz += 0.5 * self.concomitant * (a * a + b * b);
        }
        Drive {
            bx: field.rf_amplitude * field.rf_phase.cos(),
            by: field.rf_amplitude * field.rf_phase.sin(),
            bz,
            rf: field.rf_amplitude.abs(),
        }
    }
}

#[inline]
fn bloch(drive: &Drive, bz: f64, pool: &Pool, m: &[f64], dm: &mut [f64]) {
    let (mx, my, mz) = (m[0], m[1], m[2]);
    dm[0] = bz * my - drive.by * mz - pool.r2 * mx;
    dm[1] = -bz * mx + drive.bx * mz - pool.r2 * my;
    dm[2] = drive.by * mx - drive.bx * my + pool.r1 * (pool.m0 - mz);
}

/// Single pool, three state components.
#[derive(Debug, Clone)]
pub(crate) struct BlochSystem<'a> {
    pub field: FieldModel<'a>,
    pub pool: Pool,
    /// Absolute tolerance of the run; below it the signal counts as noise.
    pub guard: f64,
}

impl OdeSystem for BlochSystem<'_> {
    fn dimension(&self) -> usize {
        3
    }

    fn derivative(&self, t: f64, y: &[f64], dy: &mut [f64]) {
        let drive = self.field.drive(t);
        let transverse = y[0].hypot(y[1]);

        // Near equilibrium with RF off the exact derivative is round-off;
        // pin it to zero so the controller is not chasing noise.
        if transverse < self.guard * self.pool.m0 && drive.rf < RF_EPSILON {
            dy[0] = 0.0;
            dy[1] = 0.0;
            dy[2] = if (self.pool.m0 - y[2]).abs() < self.guard {
                0.0
            } else {
                self.pool.r1 * (self.pool.m0 - y[2])
            };
            return;
        }

        bloch(&drive, drive.bz + self.pool.chemical_shift, &self.pool, y, dy);
    }
}

/// `P` coupled pools, `3P` state components.
#[derive(Debug, Clone)]
pub(crate) struct McConnellSystem<'a> {
    pub field: FieldModel<'a>,
    pub pools: Vec<Pool>,
    pub exchange: ExchangeMatrix,
}

impl OdeSystem for McConnellSystem<'_> {
    fn dimension(&self) -> usize {
        3 * self.pools.len()
    }

    fn derivative(&self, t: f64, y: &[f64], dy: &mut [f64]) {
        let drive = self.field.drive(t);
        let pools = self.pools.len();

        for (p, pool) in self.pools.iter().enumerate() {
            let base = 3 * p;
            let out = &mut dy[base..base + 3];
            if pool.m0 <= 0.0 {
                out.fill(0.0);
                continue;
            }
            bloch(&drive, drive.bz + pool.chemical_shift, pool, &y[base..base + 3], out);

            let loss = self.exchange.outflow(p);
            for c in 0..3 {
                let mut gain = 0.0;
                for j in (0..pools).filter(|&j| j != p) {
                    gain += self.exchange.rate(j, p) * y[3 * j + c];
                }
                out[c] += gain - loss * y[base + c];
            }
        }
    }
}
