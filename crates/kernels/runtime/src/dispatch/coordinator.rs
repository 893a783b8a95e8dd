//! Spin bookkeeping of the coordinator.
//!
//! Every spin index moves through
//!
//! ```text
//! Pending -> Claimed(rank) -> Done | Failed
//! ```
//!
//! and only [`BatchCoordinator::claim`] performs the first transition, so a
//! spin is handed to exactly one worker exactly once. Each worker first
//! drains its own static range; with load balancing enabled it then takes
//! batches from the tail of whichever range has the most work left.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::checkpoint::SpinStatus;
use crate::error::ConfigError;

use super::partition::partition_static;

/// Batch size bounds for dynamic load balancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancing {
    pub min_batch: usize,
    pub max_batch: usize,
}

impl Default for LoadBalancing {
    fn default() -> Self {
        Self {
            min_batch: 1,
            max_batch: 64,
        }
    }
}

impl LoadBalancing {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_batch == 0 || self.min_batch > self.max_batch {
            return Err(ConfigError::InvalidOption(format!(
                "load balancing batch bounds {}..={} are invalid",
                self.min_batch, self.max_batch
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpinState {
    Pending,
    Claimed(usize),
    Done,
    Failed,
}

/// A state transition that would process a spin twice or not at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("spin {spin} reported by worker {rank} while {state:?}")]
pub struct ClaimViolation {
    pub spin: usize,
    pub rank: usize,
    pub state: SpinState,
}

/// Hands out spin batches and records their outcome.
#[derive(Debug)]
pub struct BatchCoordinator {
    states: Vec<SpinState>,
    /// Unclaimed remainder of each worker's static range.
    ranges: Vec<Range<usize>>,
    batch_size: usize,
    balancing: Option<LoadBalancing>,
    pending: usize,
}

impl BatchCoordinator {
    /// `batch_size` caps a batch taken from a worker's own range.
    pub fn new(
        total: usize,
        workers: usize,
        batch_size: usize,
        balancing: Option<LoadBalancing>,
    ) -> Self {
        Self {
            states: vec![SpinState::Pending; total],
            ranges: partition_static(total, workers),
            batch_size: batch_size.max(1),
            balancing,
            pending: total,
        }
    }

    /// Mark spins finished by an earlier run so they are never claimed.
    pub fn restore(&mut self, statuses: &[SpinStatus]) {
        for (state, status) in self.states.iter_mut().zip(statuses) {
            let restored = match status {
                SpinStatus::Pending => continue,
                SpinStatus::Done => SpinState::Done,
                SpinStatus::Failed => SpinState::Failed,
            };
            if *state == SpinState::Pending {
                self.pending -= 1;
            }
            *state = restored;
        }
    }

    pub fn state(&self, spin: usize) -> SpinState {
        self.states[spin]
    }

    pub fn total(&self) -> usize {
        self.states.len()
    }

    /// Spins that are neither claimed nor finished.
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn finished(&self) -> usize {
        self.states
            .iter()
            .filter(|s| matches!(s, SpinState::Done | SpinState::Failed))
            .count()
    }

    pub fn count(&self, state: SpinState) -> usize {
        self.states.iter().filter(|s| **s == state).count()
    }

    /// Indices of every spin currently in `state`, ascending.
    pub fn spins_in(&self, state: SpinState) -> Vec<usize> {
        (0..self.states.len())
            .filter(|&spin| self.states[spin] == state)
            .collect()
    }

    /// Persistable view; claimed spins are reported as pending.
    pub fn statuses(&self) -> Vec<SpinStatus> {
        self.states.iter().map(|&state| state.into()).collect()
    }

    /// Next batch for worker `rank`, or `None` when it should stop.
    pub fn claim(&mut self, rank: usize) -> Option<Vec<usize>> {
        let size = self.next_batch_size();
        let own = self.take_front(rank, size);
        if !own.is_empty() {
            return Some(self.mark_claimed(rank, own));
        }
        self.balancing?;
        loop {
            let victim = self.fullest_range()?;
            let stolen = self.take_back(victim, size);
            if !stolen.is_empty() {
                return Some(self.mark_claimed(rank, stolen));
            }
        }
    }

    /// Record the outcome of a claimed spin.
    pub fn complete(&mut self, rank: usize, spin: usize, ok: bool) -> Result<(), ClaimViolation> {
        let state = self.states[spin];
        if state != SpinState::Claimed(rank) {
            return Err(ClaimViolation { spin, rank, state });
        }
        self.states[spin] = if ok { SpinState::Done } else { SpinState::Failed };
        Ok(())
    }

    /// Guided sizing: a share of the remaining work, clamped to the bounds.
    fn next_batch_size(&self) -> usize {
        match self.balancing {
            None => self.batch_size,
            Some(bounds) => {
                let workers = self.ranges.len().max(1);
                (self.pending / (2 * workers))
                    .clamp(bounds.min_batch, bounds.max_batch)
                    .min(self.batch_size.max(bounds.min_batch))
            }
        }
    }

    fn take_front(&mut self, rank: usize, size: usize) -> Vec<usize> {
        let mut batch = Vec::with_capacity(size);
        let Some(range) = self.ranges.get_mut(rank) else {
            return batch;
        };
        while batch.len() < size {
            let Some(spin) = range.next() else { break };
            if self.states[spin] == SpinState::Pending {
                batch.push(spin);
            }
        }
        batch
    }

    fn take_back(&mut self, victim: usize, size: usize) -> Vec<usize> {
        let range = &mut self.ranges[victim];
        let mut batch = Vec::with_capacity(size);
        while batch.len() < size {
            let Some(spin) = range.next_back() else { break };
            if self.states[spin] == SpinState::Pending {
                batch.push(spin);
            }
        }
        batch.reverse();
        batch
    }

    fn fullest_range(&self) -> Option<usize> {
        self.ranges
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.is_empty())
            .max_by_key(|(rank, r)| (r.len(), std::cmp::Reverse(*rank)))
            .map(|(rank, _)| rank)
    }

    fn mark_claimed(&mut self, rank: usize, batch: Vec<usize>) -> Vec<usize> {
        for &spin in &batch {
            self.states[spin] = SpinState::Claimed(rank);
        }
        self.pending -= batch.len();
        batch
    }
}

impl From<SpinState> for SpinStatus {
    fn from(state: SpinState) -> Self {
        match state {
            SpinState::Pending | SpinState::Claimed(_) => SpinStatus::Pending,
            SpinState::Done => SpinStatus::Done,
            SpinState::Failed => SpinStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(coordinator: &mut BatchCoordinator, rank: usize) -> Vec<usize> {
        let mut seen = Vec::new();
        while let Some(batch) = coordinator.claim(rank) {
            for &spin in &batch {
                coordinator.complete(rank, spin, true).unwrap();
            }
            seen.extend(batch);
        }
        seen
    }

    #[test]
    fn test_static_claims_stay_in_own_range() {
        let mut coordinator = BatchCoordinator::new(10, 2, 3, None);
        assert_eq!(coordinator.claim(0), Some(vec![0, 1, 2]));
        assert_eq!(coordinator.claim(0), Some(vec![3, 4]));
        assert_eq!(coordinator.claim(0), None);
        assert_eq!(coordinator.pending(), 5);
        assert_eq!(coordinator.claim(1), Some(vec![5, 6, 7]));
    }

    #[test]
    fn test_balancing_steals_from_the_fullest_tail() {
        let bounds = LoadBalancing {
            min_batch: 2,
            max_batch: 2,
        };
        let mut coordinator = BatchCoordinator::new(12, 3, 2, Some(bounds));
        assert_eq!(coordinator.claim(1), Some(vec![4, 5]));
        assert_eq!(drain(&mut coordinator, 0), vec![0, 1, 2, 3, 10, 11, 6, 7, 8, 9]);
        assert_eq!(coordinator.claim(2), None);
        assert_eq!(coordinator.pending(), 0);
    }

    #[test]
    fn test_every_spin_is_claimed_exactly_once() {
        let mut coordinator = BatchCoordinator::new(101, 4, 8, Some(LoadBalancing::default()));
        let mut seen = Vec::new();
        // round-robin claims interleave own and stolen batches
        let mut active = vec![true; 4];
        while active.iter().any(|a| *a) {
            for rank in 0..4 {
                if !active[rank] {
                    continue;
                }
                match coordinator.claim(rank) {
                    Some(batch) => {
                        for &spin in &batch {
                            coordinator.complete(rank, spin, spin % 7 != 0).unwrap();
                        }
                        seen.extend(batch);
                    }
                    None => active[rank] = false,
                }
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..101).collect::<Vec<_>>());
        assert_eq!(coordinator.finished(), 101);
        assert_eq!(coordinator.state(7), SpinState::Failed);
        assert_eq!(coordinator.spins_in(SpinState::Failed), (0..101).step_by(7).collect::<Vec<_>>());
        assert_eq!(coordinator.count(SpinState::Done), 101 - 15);
    }

    #[test]
    fn test_completing_an_unclaimed_spin_is_rejected() {
        let mut coordinator = BatchCoordinator::new(4, 2, 4, None);
        let err = coordinator.complete(0, 1, true).unwrap_err();
        assert_eq!(err.state, SpinState::Pending);

        coordinator.claim(0);
        coordinator.complete(0, 1, true).unwrap();
        assert!(coordinator.complete(0, 1, true).is_err());
        assert!(coordinator.complete(1, 0, true).is_err());
    }

    #[test]
    fn test_restored_spins_are_skipped() {
        let mut coordinator = BatchCoordinator::new(6, 1, 10, None);
        coordinator.restore(&[
            SpinStatus::Done,
            SpinStatus::Pending,
            SpinStatus::Failed,
            SpinStatus::Done,
            SpinStatus::Pending,
            SpinStatus::Pending,
        ]);
        assert_eq!(coordinator.pending(), 3);
        assert_eq!(coordinator.claim(0), Some(vec![1, 4, 5]));
        let statuses = coordinator.statuses();
        assert_eq!(statuses[2], SpinStatus::Failed);
        assert_eq!(statuses[1], SpinStatus::Pending);
    }
}
