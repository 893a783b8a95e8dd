//! Time integration of one spin through one atomic block.
//!
//! [`MagnetizationIntegrator`] owns the stepper and the physics model for a
//! spin inside a block. The walker drives it from time point to time point:
//!
//! ```text
//! new ── advance_to(t1) ── advance_to(t2) ── restart_at(t2, M) ── advance_to(t3) ...
//!                       sample           discontinuity
//! ```
//!
//! A spin with at most one populated pool is integrated with the plain
//! Bloch equations on three components. More populated pools switch to the
//! coupled Bloch-McConnell system on `3P` components.

mod bloch;
mod dopri;
pub mod exchange;
pub mod tolerance;


pub use bloch::RF_EPSILON;
pub use dopri::{DormandPrince, OdeSystem};
pub use exchange::{ExchangeMatrix, ExchangeRate, ExchangeRates};
pub use tolerance::{IntegratorSettings, RTOL_FLOOR, Tolerances};

use crate::error::IntegrationFailure;
use crate::sample::Pool;
use crate::sequence::BlockField;
use crate::trajectory::BlockPath;
use crate::types::Magnetization;

use bloch::{BlochSystem, FieldModel, McConnellSystem};

/// Per-spin physical context of one integration.
#[derive(Debug, Clone, Copy)]
pub struct SpinEnvironment<'a> {
    /// Where the spin is at each block time.
    pub path: &'a BlockPath<'a>,
    /// Static off-resonance (rad/ms).
    pub off_resonance: f64,
    pub pools: &'a [Pool],
    pub exchange: &'a ExchangeMatrix,
    /// Concomitant field coefficient; 0 disables the correction.
    pub concomitant: f64,
}

impl SpinEnvironment<'_> {
    /// Indices of pools with non-zero equilibrium magnetization.
    pub fn populated_pools(&self) -> impl Iterator<Item = usize> + '_ {
        self.pools
            .iter()
            .enumerate()
            .filter(|(_, p)| p.m0 > 0.0)
            .map(|(i, _)| i)
    }
}

#[derive(Debug, Clone)]
enum Model<'a> {
    Single { pool: usize, system: BlochSystem<'a> },
    Coupled(McConnellSystem<'a>),
}

impl<'a> Model<'a> {
    fn field_mut(&mut self) -> &mut FieldModel<'a> {
        match self {
            Model::Single { system, .. } => &mut system.field,
            Model::Coupled(system) => &mut system.field,
        }
    }
}

/// Adaptive integrator bound to one spin and one atomic block.
#[derive(Debug, Clone)]
pub struct MagnetizationIntegrator<'a> {
    block: &'a BlockField<'a>,
    model: Model<'a>,
    stepper: DormandPrince,
    state: Magnetization,
    scratch: Vec<f64>,
}

impl<'a> MagnetizationIntegrator<'a> {
    /// Prepare the integrator and restart it at block time 0 from `initial`.
    pub fn new(
        block: &'a BlockField<'a>,
        env: SpinEnvironment<'a>,
        tolerances: &Tolerances,
        initial: &Magnetization,
    ) -> Result<Self, IntegrationFailure> {
        let field = FieldModel {
            block,
            window: block.window(0.0),
            path: env.path,
            off_resonance: env.off_resonance,
            concomitant: env.concomitant,
        };

        let populated: Vec<usize> = env.populated_pools().collect();
        let (model, atol) = if populated.len() <= 1 {
            let pool = populated.first().copied().unwrap_or(0);
            let params = env.pools.get(pool).copied().unwrap_or_default();
            let atol = tolerances.component_atol([params.m0]);
            let system = BlochSystem {
                field,
                pool: params,
                guard: tolerances.atol,
            };
            (Model::Single { pool, system }, atol)
        } else {
            let atol = tolerances.component_atol(env.pools.iter().map(|p| p.m0));
            let system = McConnellSystem {
                field,
                pools: env.pools.to_vec(),
                exchange: env.exchange.clone(),
            };
            (Model::Coupled(system), atol)
        };

        let mut integrator = Self {
            block,
            model,
            scratch: vec![0.0; atol.len()],
            stepper: DormandPrince::new(tolerances, atol),
            state: initial.clone(),
        };
        integrator.restart(0.0)?;
        Ok(integrator)
    }

    /// Continue from `state` at block time `t`, forgetting the step history.
    ///
    /// Called at every discontinuity so that no step straddles a jump and
    /// the new field window covers the interval that follows.
    pub fn restart_at(&mut self, t: f64, state: &Magnetization) -> Result<(), IntegrationFailure> {
        self.state.clone_from(state);
        self.restart(t)
    }

    fn restart(&mut self, t: f64) -> Result<(), IntegrationFailure> {
        self.model.field_mut().window = self.block.window(t);
        match &self.model {
            Model::Single { pool, system } => {
                let base = 3 * pool;
                let y = &self.state.as_slice()[base..base + 3];
                self.stepper.restart(system, t, y)
            }
            Model::Coupled(system) => self.stepper.restart(system, t, self.state.as_slice()),
        }
    }

    /// Integrate up to `target`, never stepping past `hard_stop`.
    pub fn advance_to(
        &mut self,
        target: f64,
        hard_stop: f64,
    ) -> Result<&Magnetization, IntegrationFailure> {
        match &self.model {
            Model::Single { pool, system } => {
                self.stepper
                    .advance(system, target, hard_stop, &mut self.scratch)?;
                let base = 3 * pool;
                self.state.as_mut_slice()[base..base + 3].copy_from_slice(&self.scratch);
            }
            Model::Coupled(system) => {
                self.stepper
                    .advance(system, target, hard_stop, &mut self.scratch)?;
                self.state.as_mut_slice().copy_from_slice(&self.scratch);
            }
        }
        if !self.state.is_finite() {
            return Err(IntegrationFailure::NonFinite { time: target });
        }
        Ok(&self.state)
    }

    /// Magnetization at the last `advance_to` target.
    pub fn state(&self) -> &Magnetization {
        &self.state
    }

    pub fn into_state(self) -> Magnetization {
        self.state
    }

    /// Attempted steps so far, for diagnostics.
    pub fn steps(&self) -> usize {
        self.stepper.steps()
    }

    pub fn is_coupled(&self) -> bool {
        matches!(self.model, Model::Coupled(_))
    }
}
