//! Inter-pool exchange rates under detailed balance.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// One configured exchange path `from -> to` (1/ms).
///
/// The reverse rate is never configured; it follows from the pool sizes
/// of each spin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub from: usize,
    pub to: usize,
    pub rate: f64,
}

/// Validated forward rates shared by the whole population.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRates {
    pools: usize,
    paths: Vec<ExchangeRate>,
}

impl ExchangeRates {
    pub fn none(pools: usize) -> Self {
        Self {
            pools,
            paths: Vec::new(),
        }
    }

    pub fn new(pools: usize, paths: Vec<ExchangeRate>) -> Result<Self, ConfigError> {
        let invalid = |path: &ExchangeRate, reason: &str| ConfigError::InvalidExchange {
            from: path.from,
            to: path.to,
            reason: reason.to_string(),
        };
        let mut seen = Vec::with_capacity(paths.len());
        for path in &paths {
            if path.from == path.to {
                return Err(invalid(path, "a pool cannot exchange with itself"));
            }
            if path.from >= pools || path.to >= pools {
                return Err(invalid(path, &format!("only {pools} pools exist")));
            }
            if !(path.rate.is_finite() && path.rate >= 0.0) {
                return Err(invalid(path, "rate must be finite and non-negative"));
            }
            let pair = (path.from.min(path.to), path.from.max(path.to));
            if seen.contains(&pair) {
                return Err(invalid(path, "pair configured twice; the reverse rate is derived"));
            }
            seen.push(pair);
        }
        Ok(Self { pools, paths })
    }

    pub fn pools(&self) -> usize {
        self.pools
    }

    pub fn paths(&self) -> &[ExchangeRate] {
        &self.paths
    }
}

/// Per-spin `P x P` matrix with `rate(i, j) = k(i -> j)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeMatrix {
    pools: usize,
    k: Vec<f64>,
    outflow: Vec<f64>,
}

impl ExchangeMatrix {
    /// Complete the configured paths using this spin's pool sizes.
    ///
    /// For each configured `k(i -> j)` the reverse rate is
    /// `k(j -> i) = k(i -> j) * M0_i / M0_j`, so that
    /// `k(j -> i) * M0_j == k(i -> j) * M0_i`. A pair involving an empty
    /// pool exchanges nothing in either direction.
    pub fn derive(rates: &ExchangeRates, m0: &[f64]) -> Self {
        let pools = m0.len();
        let mut k = vec![0.0; pools * pools];
        for path in rates.paths() {
            let (i, j) = (path.from, path.to);
            if i >= pools || j >= pools || m0[i] <= 0.0 || m0[j] <= 0.0 {
                continue;
            }
            k[i * pools + j] = path.rate;
            k[j * pools + i] = path.rate * m0[i] / m0[j];
        }
        let outflow = (0..pools)
            .map(|i| k[i * pools..(i + 1) * pools].iter().sum())
            .collect();
        Self { pools, k, outflow }
    }

    pub fn pools(&self) -> usize {
        self.pools
    }

    /// `k(from -> to)`.
    #[inline]
    pub fn rate(&self, from: usize, to: usize) -> f64 {
        self.k[from * self.pools + to]
    }

    /// `sum_j k(i -> j)`.
    #[inline]
    pub fn outflow(&self, pool: usize) -> f64 {
        self.outflow[pool]
    }

    pub fn is_empty(&self) -> bool {
        self.k.iter().all(|&r| r == 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_pools_have_symmetric_rates() {
        let rates = ExchangeRates::new(
            2,
            vec![ExchangeRate {
                from: 0,
                to: 1,
                rate: 0.02,
            }],
        )
        .unwrap();
        let matrix = ExchangeMatrix::derive(&rates, &[0.5, 0.5]);
        assert_eq!(matrix.rate(1, 0), 0.02);
        assert_eq!(matrix.rate(0, 1), 0.02);
    }

    #[test]
    fn test_detailed_balance_holds() {
        let rates = ExchangeRates::new(
            3,
            vec![
                ExchangeRate { from: 0, to: 1, rate: 0.03 },
                ExchangeRate { from: 2, to: 0, rate: 0.01 },
            ],
        )
        .unwrap();
        let m0 = [0.7, 0.2, 0.1];
        let matrix = ExchangeMatrix::derive(&rates, &m0);
        for i in 0..3 {
            for j in 0..3 {
                let lhs = matrix.rate(j, i) * m0[j];
                let rhs = matrix.rate(i, j) * m0[i];
                assert!((lhs - rhs).abs() < 1e-15, "balance broken for {i}<->{j}");
            }
        }
        assert!((matrix.outflow(0) - (0.03 + 0.01 * 0.1 / 0.7)).abs() < 1e-15);
    }

    #[test]
    fn test_empty_pool_disables_exchange() {
        let rates =
            ExchangeRates::new(2, vec![ExchangeRate { from: 0, to: 1, rate: 0.5 }]).unwrap();
        let matrix = ExchangeMatrix::derive(&rates, &[1.0, 0.0]);
        assert!(matrix.is_empty());
    }

    #[test]
    fn test_invalid_paths_are_rejected() {
        let path = |from, to, rate| ExchangeRate { from, to, rate };
        assert!(ExchangeRates::new(2, vec![path(0, 0, 0.1)]).is_err());
        assert!(ExchangeRates::new(2, vec![path(0, 2, 0.1)]).is_err());
        assert!(ExchangeRates::new(2, vec![path(0, 1, -0.1)]).is_err());
        assert!(ExchangeRates::new(2, vec![path(0, 1, 0.1), path(1, 0, 0.1)]).is_err());
    }
}
