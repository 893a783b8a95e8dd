//! Deterministic combination of partial signals.
//!
//! Partial sums arrive from workers in whatever order they finish, and with
//! dynamic load balancing the spins inside each partial differ from run to
//! run. Reducing the partials with a pairing fixed by index, never by
//! arrival, keeps the result independent of timing for a given partition:
//!
//! ```text
//! Partials: [resumed, w0, w1, w2, w3]
//!
//! Level 0: resumed+w0  w1+w2  w3
//! Level 1: (resumed+w0)+(w1+w2)  w3
//! Level 2: ((resumed+w0)+(w1+w2))+w3
//! ```
//!
//! Odd elements are carried up unchanged.

use rayon::prelude::*;

use crate::signal::{SignalRecord, SignalSet};

// ============================================================================
// Core Tree Reduction
// ============================================================================

/// Reduce `values` pairwise along a fixed binary tree.
///
/// Returns `None` for an empty input.
///
/// ```
/// use larmor_runtime::reductions::tree_reduce;
///
/// let total = tree_reduce(vec![1.0, 2.0, 3.0, 4.0, 5.0], |a, b| a + b);
/// assert_eq!(total, Some(15.0));
/// ```
pub fn tree_reduce<T, F>(values: Vec<T>, op: F) -> Option<T>
where
    F: Fn(T, T) -> T,
{
    let mut current = values;
    while current.len() > 1 {
        let mut next = Vec::with_capacity(current.len().div_ceil(2));
        let mut items = current.into_iter();
        while let Some(a) = items.next() {
            match items.next() {
                Some(b) => next.push(op(a, b)),
                None => next.push(a),
            }
        }
        current = next;
    }
    current.pop()
}

/// Fixed-tree sum; bitwise identical for identical inputs.
pub fn sum(values: &[f64]) -> f64 {
    tree_reduce(values.to_vec(), |a, b| a + b).unwrap_or(0.0)
}

// ============================================================================
// Signal Reduction
// ============================================================================

fn add_records(mut a: Vec<SignalRecord>, b: Vec<SignalRecord>) -> Vec<SignalRecord> {
    for (x, y) in a.iter_mut().zip(&b) {
        x.accumulate(y);
    }
    a
}

/// Combine partial signal sets in the given order.
///
/// Channels are reduced in parallel; within a channel the pairing is
/// fixed by the position of each partial. All partials must be
/// [compatible](SignalSet::is_compatible); `None` if there are none.
pub fn reduce_signal_sets(partials: Vec<SignalSet>) -> Option<SignalSet> {
    let channels = partials.first()?.channel_count();
    debug_assert!(partials.iter().all(|p| p.is_compatible(&partials[0])));

    // transpose to per-channel lists, keeping partial order
    let mut per_channel: Vec<Vec<Vec<SignalRecord>>> =
        (0..channels).map(|_| Vec::with_capacity(partials.len())).collect();
    for partial in partials {
        for (c, records) in partial.into_channels().into_iter().enumerate() {
            per_channel[c].push(records);
        }
    }

    let reduced: Vec<Vec<SignalRecord>> = per_channel
        .into_par_iter()
        .map(|lists| tree_reduce(lists, add_records).unwrap_or_default())
        .collect();
    Some(SignalSet::from_channels(reduced))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_reduce_empty() {
        let values: Vec<f64> = Vec::new();
        assert_eq!(tree_reduce(values, |a, b| a + b), None);
    }

    #[test]
    fn test_tree_reduce_pairing_is_fixed() {
        // string concatenation exposes the tree shape
        let values: Vec<String> = ["a", "b", "c", "d", "e"].iter().map(|s| s.to_string()).collect();
        let shape = tree_reduce(values, |a, b| format!("({a}{b})")).unwrap();
        assert_eq!(shape, "(((ab)(cd))e)");
    }

    #[test]
    fn test_sum_deterministic() {
        let values: Vec<f64> = (0..1000).map(|i| (i as f64 * 0.1).sin()).collect();
        assert_eq!(sum(&values).to_bits(), sum(&values).to_bits());
        assert_eq!(sum(&[]), 0.0);
    }

    #[test]
    fn test_reduce_signal_sets() {
        let times = [1.0, 2.0];
        let partials: Vec<SignalSet> = (0..3)
            .map(|i| {
                let mut set = SignalSet::with_timeline(2, &times);
                set.add(0, 0, [1.0, 0.0, f64::from(i)]);
                set.add(1, 1, [0.0, 2.0, 0.0]);
                set
            })
            .collect();
        let total = reduce_signal_sets(partials).unwrap();
        assert_eq!(total.channel(0)[0].mx, 3.0);
        assert_eq!(total.channel(0)[0].mz, 3.0);
        assert_eq!(total.channel(1)[1].my, 6.0);
        assert_eq!(total.channel(1)[1].time, 2.0);
        assert!(reduce_signal_sets(Vec::new()).is_none());
    }
}
