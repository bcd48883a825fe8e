//! Key range coalescing
//!
//! Deleting a batch of records key by key costs one engine request per key.
//! Runs of consecutive integer keys collapse into closed ranges, so a batch
//! delete costs one request per run instead.

use std::ops::RangeInclusive;

/// Collapse ascending, unique integer keys into minimal closed ranges.
///
/// The input must already be sorted ascending without duplicates; the
/// function does not sort. The union of the returned ranges equals the input,
/// and consecutive ranges are separated by a gap of at least two.
///
/// ```rust
/// use stow_core::coalesce::coalesce;
///
/// assert_eq!(coalesce(&[1, 2, 3, 7, 8, 10]), vec![1..=3, 7..=8, 10..=10]);
/// ```
pub fn coalesce(keys: &[i64]) -> Vec<RangeInclusive<i64>> {
    let Some((&first, rest)) = keys.split_first() else {
        return Vec::new();
    };

    let mut ranges = Vec::new();
    let mut start = first;
    let mut prev = first;

    for &key in rest {
        if prev.checked_add(1) == Some(key) {
            prev = key;
        } else {
            ranges.push(start..=prev);
            start = key;
            prev = key;
        }
    }
    ranges.push(start..=prev);

    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_empty() {
        assert_eq!(coalesce(&[]), Vec::<RangeInclusive<i64>>::new());
    }

    #[test]
    fn test_single_key() {
        assert_eq!(coalesce(&[5]), vec![5..=5]);
    }

    #[test]
    fn test_contiguous() {
        assert_eq!(coalesce(&[1, 2, 3]), vec![1..=3]);
    }

    #[test]
    fn test_mixed_runs() {
        assert_eq!(
            coalesce(&[1, 2, 3, 7, 8, 10]),
            vec![1..=3, 7..=8, 10..=10]
        );
    }

    #[test]
    fn test_no_runs() {
        assert_eq!(coalesce(&[1, 3, 5]), vec![1..=1, 3..=3, 5..=5]);
    }

    #[test]
    fn test_negative_and_extreme_keys() {
        assert_eq!(coalesce(&[-3, -2, -1, 0, 2]), vec![-3..=0, 2..=2]);
        assert_eq!(
            coalesce(&[i64::MAX - 1, i64::MAX]),
            vec![i64::MAX - 1..=i64::MAX]
        );
    }

    proptest! {
        #[test]
        fn prop_ranges_cover_input_exactly(set in prop::collection::btree_set(-500i64..500, 0..200)) {
            let keys: Vec<i64> = set.into_iter().collect();
            let ranges = coalesce(&keys);

            let expanded: Vec<i64> = ranges.iter().flat_map(|r| r.clone()).collect();
            prop_assert_eq!(&expanded, &keys);

            for pair in ranges.windows(2) {
                prop_assert!(*pair[1].start() >= *pair[0].end() + 2);
            }
        }
    }
}
