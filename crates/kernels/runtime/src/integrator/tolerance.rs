//! Step-size control tolerances.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Relative tolerance below which tightening has no further effect.
pub const RTOL_FLOOR: f64 = 1.0e-10;

/// Error-control settings of one integration run.
///
/// The absolute tolerance of each state component is `atol * M0` of the
/// pool it belongs to, never less than `atol_floor`. Empty pools therefore
/// still get a finite tolerance instead of forcing the controller into
/// arbitrarily small steps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Tolerances {
    pub rtol: f64,
    pub atol: f64,
    pub atol_floor: f64,
    /// Step budget for one atomic block.
    pub max_steps: usize,
    /// Upper bound on a single step (ms); 0 means unbounded.
    pub max_step: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self::single_pool()
    }
}

impl Tolerances {
    pub const fn single_pool() -> Self {
        Self {
            rtol: 1.0e-6,
            atol: 1.0e-8,
            atol_floor: 1.0e-12,
            max_steps: 1_000_000,
            max_step: 0.0,
        }
    }

    /// Exchange makes the coupled system stiffer and more expensive per
    /// step; the looser default keeps step counts comparable.
    pub const fn coupled() -> Self {
        Self {
            rtol: 1.0e-4,
            atol: 1.0e-6,
            ..Self::single_pool()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(ConfigError::InvalidTolerance(format!("{name} must be positive, got {v}")))
            }
        };
        positive("rtol", self.rtol)?;
        positive("atol", self.atol)?;
        positive("atolFloor", self.atol_floor)?;
        if self.max_steps == 0 {
            return Err(ConfigError::InvalidTolerance("maxSteps must be at least 1".into()));
        }
        if !(self.max_step >= 0.0) {
            return Err(ConfigError::InvalidTolerance(format!(
                "maxStep must be non-negative, got {}",
                self.max_step
            )));
        }
        Ok(())
    }

    /// Tolerances scaled down by `factor`, or `None` when already at the floor.
    pub fn tightened(&self, factor: f64) -> Option<Self> {
        // repeated scaling by 0.1 lands a few ulps above the floor
        if self.rtol <= RTOL_FLOOR * (1.0 + 1.0e-9) {
            return None;
        }
        Some(Self {
            rtol: (self.rtol * factor).max(RTOL_FLOOR),
            atol: (self.atol * factor).max(self.atol_floor),
            ..*self
        })
    }

    /// Per-component absolute tolerance for pools with the given M0.
    pub fn component_atol(&self, m0: impl IntoIterator<Item = f64>) -> Vec<f64> {
        m0.into_iter()
            .flat_map(|m| [(self.atol * m.abs()).max(self.atol_floor); 3])
            .collect()
    }

    pub(crate) fn max_step(&self) -> Option<f64> {
        (self.max_step > 0.0).then_some(self.max_step)
    }
}

/// Defaults for both physics models, overridable from the scenario.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IntegratorSettings {
    pub single_pool: Tolerances,
    pub coupled: Tolerances,
    /// Factor applied to both tolerances on every retry of a failed block.
    pub retry_factor: f64,
}

impl Default for IntegratorSettings {
    fn default() -> Self {
        Self {
            single_pool: Tolerances::single_pool(),
            coupled: Tolerances::coupled(),
            retry_factor: 0.1,
        }
    }
}

impl IntegratorSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.single_pool.validate()?;
        self.coupled.validate()?;
        if !(self.retry_factor > 0.0 && self.retry_factor < 1.0) {
            return Err(ConfigError::InvalidTolerance(format!(
                "retryFactor must lie in (0, 1), got {}",
                self.retry_factor
            )));
        }
        Ok(())
    }

    /// Tolerances for a spin with `populated` non-empty pools.
    pub fn for_populated_pools(&self, populated: usize) -> Tolerances {
        if populated > 1 {
            self.coupled
        } else {
            self.single_pool
        }
    }
}
