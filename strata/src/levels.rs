//! Bucket arithmetic for rollup levels.
//!
//! All times are milliseconds since the epoch. A level with interval zero is
//! the raw level: every capture time is its own bucket.

use crate::row::TimeRange;

/// The latest bucket boundary at or before `capture_time`.
///
/// Rounds down, never up. A bucket ending after `capture_time` could still
/// receive input, so it is not safe to finalize.
#[must_use]
pub fn safe_rollup_time(capture_time: i64, interval_millis: i64) -> i64 {
    if interval_millis <= 0 {
        return capture_time;
    }
    capture_time.div_euclid(interval_millis) * interval_millis
}

/// The boundary of the bucket that `capture_time` falls into, that is the
/// smallest multiple of the interval not before `capture_time`.
#[must_use]
pub fn bucket_boundary(capture_time: i64, interval_millis: i64) -> i64 {
    if interval_millis <= 0 {
        return capture_time;
    }
    let floor = safe_rollup_time(capture_time, interval_millis);
    if floor == capture_time {
        floor
    } else {
        floor + interval_millis
    }
}

/// The input window of the bucket ending at `boundary`.
#[must_use]
pub fn bucket_window(boundary: i64, interval_millis: i64) -> TimeRange {
    if interval_millis <= 0 {
        TimeRange::new(boundary - 1, boundary)
    } else {
        TimeRange::new(boundary - interval_millis, boundary)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{bucket_boundary, bucket_window, safe_rollup_time};

    #[test]
    fn five_minute_examples() {
        assert_eq!(safe_rollup_time(180_000, 300_000), 0);
        assert_eq!(safe_rollup_time(300_000, 300_000), 300_000);
        assert_eq!(safe_rollup_time(299_999, 300_000), 0);
        assert_eq!(bucket_boundary(60_000, 300_000), 300_000);
        assert_eq!(bucket_boundary(300_000, 300_000), 300_000);
        assert_eq!(bucket_boundary(300_001, 300_000), 600_000);
    }

    #[test]
    fn raw_level_is_identity() {
        assert_eq!(safe_rollup_time(12_345, 0), 12_345);
        assert_eq!(bucket_boundary(12_345, 0), 12_345);
        let window = bucket_window(12_345, 0);
        assert!(window.contains(12_345));
        assert!(!window.contains(12_344));
    }

    proptest! {
        #[test]
        fn safe_time_never_passes_input(t in 0i64..10_000_000_000, k in 1i64..1000) {
            let interval = k * 60_000;
            let safe = safe_rollup_time(t, interval);
            prop_assert!(safe <= t);
            prop_assert_eq!(safe % interval, 0);
            prop_assert!(t - safe < interval);
        }

        #[test]
        fn boundary_window_contains_input(t in 0i64..10_000_000_000, k in 1i64..1000) {
            let interval = k * 60_000;
            let boundary = bucket_boundary(t, interval);
            prop_assert_eq!(boundary % interval, 0);
            prop_assert!(bucket_window(boundary, interval).contains(t));
        }
    }
}
