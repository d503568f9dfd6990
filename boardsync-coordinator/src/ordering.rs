//! Fractional ordering keys for tasks within a column.
//!
//! Insertion between two neighbors takes the midpoint of their keys, so a
//! reorder touches exactly one task. Repeated insertion into the same gap
//! eventually exhausts `f64` precision; [`exhausted`] detects that and the
//! flush queue re-densifies the column with [`rebalanced`] keys.

/// Gap width below which a pair of neighboring keys counts as exhausted.
pub const MIN_GAP: f64 = 1e-9;

/// Spacing between keys produced by a rebalance. Wide enough for roughly a
/// thousand midpoint insertions between any pair before the next rebalance.
pub const REBALANCE_STEP: f64 = 1000.0;

/// Errors from ordering-key computation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrderError {
    /// Both bounds were given but the lower one is not below the upper one.
    #[error("invalid range: {prev} is not below {next}")]
    InvalidRange {
        /// Supplied lower bound.
        prev: f64,
        /// Supplied upper bound.
        next: f64,
    },
}

/// Returns a key strictly between `prev` and `next`.
///
/// A missing `prev` is treated as `0.0`; a missing `next` as `prev + 1.0`.
/// With neither bound the result is `0.5`, the first key of an empty column.
///
/// # Errors
///
/// Returns [`OrderError::InvalidRange`] when both bounds are present and
/// `prev >= next`.
pub fn between(prev: Option<f64>, next: Option<f64>) -> Result<f64, OrderError> {
    if let (Some(low), Some(high)) = (prev, next)
        && low >= high
    {
        return Err(OrderError::InvalidRange {
            prev: low,
            next: high,
        });
    }
    let low = prev.unwrap_or(0.0);
    let high = next.unwrap_or(low + 1.0);
    Ok((low + high) / 2.0)
}

/// Returns whether the gap between two neighboring keys is too small for
/// further midpoint insertion.
#[must_use]
pub fn exhausted(a: f64, b: f64) -> bool {
    (b - a).abs() < MIN_GAP
}

/// Returns `n` evenly spaced keys (`1000, 2000, ...`) for a column rebalance.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rebalanced(n: usize) -> Vec<f64> {
    (1..=n).map(|i| i as f64 * REBALANCE_STEP).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn between_no_bounds_is_half() {
        assert_eq!(between(None, None).unwrap(), 0.5);
    }

    #[test]
    fn between_bounded_pair_is_midpoint() {
        assert_eq!(between(Some(1.0), Some(2.0)).unwrap(), 1.5);
    }

    #[test]
    fn between_is_strictly_inside() {
        let key = between(Some(0.25), Some(0.75)).unwrap();
        assert!(key > 0.25 && key < 0.75);
    }

    #[test]
    fn between_below_only_upper_bound() {
        let key = between(None, Some(0.5)).unwrap();
        assert!(key < 0.5);
    }

    #[test]
    fn between_above_only_lower_bound() {
        let key = between(Some(3.0), None).unwrap();
        assert!(key > 3.0);
    }

    #[test]
    fn between_equal_bounds_rejected() {
        let err = between(Some(1.0), Some(1.0)).unwrap_err();
        assert!(matches!(err, OrderError::InvalidRange { .. }));
    }

    #[test]
    fn between_inverted_bounds_rejected() {
        assert!(between(Some(2.0), Some(1.0)).is_err());
    }

    #[test]
    fn exhausted_below_threshold() {
        assert!(exhausted(0.5, 0.5 + 1e-10));
        assert!(exhausted(0.5, 0.5));
    }

    #[test]
    fn exhausted_symmetric() {
        assert!(exhausted(0.500_000_000_1, 0.5));
    }

    #[test]
    fn not_exhausted_above_threshold() {
        assert!(!exhausted(0.5, 0.5 + 1e-8));
        assert!(!exhausted(1.0, 2.0));
    }

    #[test]
    fn rebalanced_is_strictly_increasing_with_wide_gaps() {
        let keys = rebalanced(10);
        assert_eq!(keys.len(), 10);
        assert_eq!(keys[0], 1000.0);
        for pair in keys.windows(2) {
            assert!(pair[1] - pair[0] >= REBALANCE_STEP);
        }
    }

    #[test]
    fn rebalanced_empty() {
        assert!(rebalanced(0).is_empty());
    }

    #[test]
    fn repeated_midpoints_eventually_exhaust() {
        let mut low = 0.0;
        let mut high = 1.0;
        let mut iterations = 0;
        while !exhausted(low, high) {
            low = between(Some(low), Some(high)).unwrap();
            iterations += 1;
            assert!(iterations < 64, "gap never exhausted");
        }
        assert!(iterations > 10);
    }
}
