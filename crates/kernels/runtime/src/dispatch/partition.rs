use std::ops::Range;

/// Split `0..total` into `workers` contiguous ranges.
///
/// Ranges are disjoint, cover `0..total` in order, and their lengths differ
/// by at most one; the first `total % workers` ranges get the extra spin.
/// Workers beyond `total` receive empty ranges.
pub fn partition_static(total: usize, workers: usize) -> Vec<Range<usize>> {
    if workers == 0 {
        return Vec::new();
    }
    let base = total / workers;
    let extra = total % workers;
    let mut start = 0;
    (0..workers)
        .map(|rank| {
            let len = base + usize::from(rank < extra);
            let range = start..start + len;
            start += len;
            range
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hundred_over_four() {
        let ranges = partition_static(100, 4);
        assert_eq!(ranges, vec![0..25, 25..50, 50..75, 75..100]);
    }

    #[test]
    fn test_uneven_split_differs_by_one() {
        let ranges = partition_static(10, 3);
        assert_eq!(ranges, vec![0..4, 4..7, 7..10]);
    }

    #[test]
    fn test_more_workers_than_spins() {
        let ranges = partition_static(2, 4);
        assert_eq!(ranges, vec![0..1, 1..2, 2..2, 2..2]);
        assert!(partition_static(5, 0).is_empty());
    }

    #[test]
    fn test_ranges_cover_population_exactly_once() {
        for total in [0usize, 1, 7, 64, 1001] {
            for workers in 1..9 {
                let ranges = partition_static(total, workers);
                assert_eq!(ranges.len(), workers);
                let mut next = 0;
                for range in &ranges {
                    assert_eq!(range.start, next);
                    next = range.end;
                }
                assert_eq!(next, total);
                let min = ranges.iter().map(|r| r.len()).min().unwrap();
                let max = ranges.iter().map(|r| r.len()).max().unwrap();
                assert!(max - min <= 1);
            }
        }
    }
}
