//! Spin population.
//!
//! A [`SpinSource`] hands out the physical properties of spin `i` on
//! demand. Workers only ever ask for indices they were assigned, so a
//! source never needs to materialise more than it stores.

use serde::{Deserialize, Serialize};

use larmor_foundation::{Fingerprint, RngStream, Vec3};

use crate::error::ConfigError;

/// One magnetization pool (compartment) of a spin.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pool {
    /// Equilibrium magnetization.
    pub m0: f64,
    /// Longitudinal relaxation rate 1/T1 (1/ms).
    pub r1: f64,
    /// Transverse relaxation rate 1/T2 (1/ms).
    pub r2: f64,
    /// Chemical shift of this pool (rad/ms).
    #[serde(default)]
    pub chemical_shift: f64,
}

impl Pool {
    pub fn new(m0: f64, r1: f64, r2: f64) -> Self {
        Self {
            m0,
            r1,
            r2,
            chemical_shift: 0.0,
        }
    }

    fn validate(&self, spin: usize) -> Result<(), ConfigError> {
        let ok = |v: f64| v.is_finite() && v >= 0.0;
        if ok(self.m0) && ok(self.r1) && ok(self.r2) && self.chemical_shift.is_finite() {
            Ok(())
        } else {
            Err(ConfigError::InvalidOption(format!(
                "spin {spin}: pool parameters must be finite and m0, r1, r2 non-negative ({self:?})"
            )))
        }
    }
}

/// Everything the engine needs to know about one spin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpinProperties {
    /// Position (mm).
    pub position: Vec3,
    /// Static off-resonance (rad/ms).
    #[serde(default)]
    pub off_resonance: f64,
    /// Reversible dephasing rate R2' = R2* - R2 (1/ms). When positive, each
    /// spin draws an extra Lorentzian-distributed off-resonance.
    #[serde(default)]
    pub r2_prime: f64,
    /// Isotropic diffusion coefficient (mm^2/ms); 0 keeps the spin fixed.
    #[serde(default)]
    pub diffusion: f64,
    /// Flow velocity (mm/ms).
    #[serde(default)]
    pub velocity: Vec3,
    pub pools: Vec<Pool>,
}

impl SpinProperties {
    pub fn m0(&self) -> impl Iterator<Item = f64> + '_ {
        self.pools.iter().map(|p| p.m0)
    }

    /// Fold every property that changes the simulated signal into `fp`.
    pub fn fingerprint(&self, fp: Fingerprint) -> Fingerprint {
        let fp = fp
            .f64_slice(&self.position)
            .f64(self.off_resonance)
            .f64(self.r2_prime)
            .f64(self.diffusion)
            .f64_slice(&self.velocity)
            .u64(self.pools.len() as u64);
        self.pools.iter().fold(fp, |fp, pool| {
            fp.f64(pool.m0)
                .f64(pool.r1)
                .f64(pool.r2)
                .f64(pool.chemical_shift)
        })
    }

    /// Off-resonance including the Lorentzian R2' draw from `rng`.
    pub fn effective_off_resonance(&self, rng: &mut RngStream) -> f64 {
        if self.r2_prime > 0.0 {
            let u = rng.uniform();
            self.off_resonance + (std::f64::consts::PI * (u - 0.5)).tan() * self.r2_prime
        } else {
            self.off_resonance
        }
    }
}

/// Random displacement of `position` by `percent` of the voxel size.
pub fn jitter_position(position: Vec3, resolution: Vec3, percent: f64, rng: &mut RngStream) -> Vec3 {
    let scale = percent / 100.0;
    std::array::from_fn(|axis| position[axis] + rng.normal() * resolution[axis] * scale)
}

/// Read access to a spin population.
pub trait SpinSource: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of pools every spin carries.
    fn pool_count(&self) -> usize;

    fn spin(&self, index: usize) -> SpinProperties;

    /// Voxel size used to scale position jitter (mm).
    fn resolution(&self) -> Vec3 {
        [0.0; 3]
    }

    /// Stable hash of the whole population, used to match checkpoints.
    ///
    /// The default visits every spin; sources that can hash their
    /// description more cheaply should override it.
    fn fingerprint(&self) -> u64 {
        let fp = Fingerprint::new()
            .u64(self.len() as u64)
            .u64(self.pool_count() as u64)
            .f64_slice(&self.resolution());
        (0..self.len())
            .fold(fp, |fp, index| self.spin(index).fingerprint(fp))
            .finish()
    }
}

/// Explicit in-memory population.
#[derive(Debug, Clone, PartialEq)]
pub struct SpinTable {
    pools: usize,
    spins: Vec<SpinProperties>,
    resolution: Vec3,
}

impl SpinTable {
    /// Validate that every spin carries exactly `pools` pools.
    pub fn new(pools: usize, spins: Vec<SpinProperties>) -> Result<Self, ConfigError> {
        if spins.is_empty() {
            return Err(ConfigError::EmptyPopulation);
        }
        for (index, spin) in spins.iter().enumerate() {
            if spin.pools.len() != pools {
                return Err(ConfigError::PoolMismatch {
                    spin: index,
                    expected: pools,
                    found: spin.pools.len(),
                });
            }
            spin.pools.iter().try_for_each(|p| p.validate(index))?;
            if !(spin.diffusion.is_finite() && spin.diffusion >= 0.0) {
                return Err(ConfigError::InvalidOption(format!(
                    "spin {index}: diffusion must be finite and non-negative"
                )));
            }
            if !spin.position.iter().all(|v| v.is_finite()) {
                return Err(ConfigError::InvalidOption(format!(
                    "spin {index}: position must be finite"
                )));
            }
            if !spin.velocity.iter().all(|v| v.is_finite()) {
                return Err(ConfigError::InvalidOption(format!(
                    "spin {index}: velocity must be finite"
                )));
            }
        }
        Ok(Self {
            pools,
            spins,
            resolution: [0.0; 3],
        })
    }

    /// Regular grid centred on the origin, every spin sharing `template`.
    pub fn grid(spec: &GridSpec) -> Result<Self, ConfigError> {
        let [nx, ny, nz] = spec.size;
        if nx * ny * nz == 0 {
            return Err(ConfigError::EmptyPopulation);
        }
        let axis = |i: usize, n: usize, res: f64| (i as f64 - 0.5 * (n as f64 - 1.0)) * res;
        let mut spins = Vec::with_capacity(nx * ny * nz);
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let position = [
                        spec.offset[0] + axis(i, nx, spec.resolution[0]),
                        spec.offset[1] + axis(j, ny, spec.resolution[1]),
                        spec.offset[2] + axis(k, nz, spec.resolution[2]),
                    ];
                    spins.push(SpinProperties {
                        position,
                        ..spec.template.clone()
                    });
                }
            }
        }
        let mut table = Self::new(spec.template.pools.len(), spins)?;
        table.resolution = spec.resolution;
        Ok(table)
    }

    pub fn with_resolution(mut self, resolution: Vec3) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn spins(&self) -> &[SpinProperties] {
        &self.spins
    }
}

impl SpinSource for SpinTable {
    fn len(&self) -> usize {
        self.spins.len()
    }

    fn pool_count(&self) -> usize {
        self.pools
    }

    fn spin(&self, index: usize) -> SpinProperties {
        self.spins[index].clone()
    }

    fn resolution(&self) -> Vec3 {
        self.resolution
    }
}

/// Grid form of a population in the scenario file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridSpec {
    /// Spins per axis.
    pub size: [usize; 3],
    /// Spacing per axis (mm).
    pub resolution: Vec3,
    #[serde(default)]
    pub offset: Vec3,
    /// Properties shared by every grid spin; its position is ignored.
    pub template: SpinProperties,
}

/// Population section of a scenario: either explicit spins or a grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SampleSpec {
    Spins(Vec<SpinProperties>),
    Grid(GridSpec),
}

impl SampleSpec {
    pub fn build(&self) -> Result<SpinTable, ConfigError> {
        match self {
            SampleSpec::Spins(spins) => {
                let pools = spins.first().map_or(0, |s| s.pools.len());
                SpinTable::new(pools, spins.clone())
            }
            SampleSpec::Grid(grid) => SpinTable::grid(grid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn water() -> SpinProperties {
        SpinProperties {
            position: [0.0; 3],
            off_resonance: 0.0,
            r2_prime: 0.0,
            diffusion: 0.0,
            velocity: [0.0; 3],
            pools: vec![Pool::new(1.0, 1.0 / 1000.0, 1.0 / 100.0)],
        }
    }

    #[test]
    fn test_grid_is_centred() {
        let table = SpinTable::grid(&GridSpec {
            size: [3, 2, 1],
            resolution: [1.0, 2.0, 1.0],
            offset: [0.0; 3],
            template: water(),
        })
        .unwrap();
        assert_eq!(table.len(), 6);
        assert_eq!(table.spin(0).position, [-1.0, -1.0, 0.0]);
        assert_eq!(table.spin(5).position, [1.0, 1.0, 0.0]);
        assert_eq!(table.resolution(), [1.0, 2.0, 1.0]);
    }

    #[test]
    fn test_pool_count_is_checked() {
        let mut two = water();
        two.pools.push(Pool::new(0.2, 0.001, 0.05));
        let err = SpinTable::new(1, vec![water(), two]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::PoolMismatch {
                spin: 1,
                expected: 1,
                found: 2
            }
        );
        assert_eq!(SpinTable::new(1, Vec::new()).unwrap_err(), ConfigError::EmptyPopulation);
    }

    #[test]
    fn test_jitter_is_reproducible() {
        let mut a = RngStream::derive(7, "position.jitter").for_spin(3);
        let mut b = RngStream::derive(7, "position.jitter").for_spin(3);
        let pa = jitter_position([1.0, 2.0, 3.0], [1.0; 3], 10.0, &mut a);
        let pb = jitter_position([1.0, 2.0, 3.0], [1.0; 3], 10.0, &mut b);
        assert_eq!(pa, pb);
        assert_ne!(pa, [1.0, 2.0, 3.0]);
        assert_eq!(jitter_position([1.0; 3], [1.0; 3], 0.0, &mut a), [1.0; 3]);
    }

    #[test]
    fn test_sample_spec_from_yaml() {
        let yaml = r#"
grid:
  size: [2, 1, 1]
  resolution: [0.5, 1.0, 1.0]
  template:
    position: [0, 0, 0]
    pools:
      - { m0: 1.0, r1: 0.001, r2: 0.01 }
"#;
        let spec: SampleSpec = serde_yaml::from_str(yaml).unwrap();
        let table = spec.build().unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.pool_count(), 1);
        assert_eq!(table.spin(1).position[0], 0.25);
    }
}
