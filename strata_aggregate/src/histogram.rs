//! Mergeable duration histogram.
//!
//! Samples land in logarithmic buckets with a fixed relative accuracy. Each
//! bucket holds an exact integer count, so merging is plain addition and any
//! grouping of merges yields identical buckets, and so identical quantiles.

use std::collections::BTreeMap;

use crate::proto::{Histogram, HistogramBucket};

/// Relative error bound of quantile estimates.
pub const RELATIVE_ACCURACY: f64 = 0.01;

fn gamma() -> f64 {
    (1.0 + RELATIVE_ACCURACY) / (1.0 - RELATIVE_ACCURACY)
}

#[allow(clippy::cast_possible_truncation)]
fn index_of(nanos: f64) -> i32 {
    (nanos.ln() / gamma().ln()).ceil() as i32
}

fn value_of(index: i32) -> f64 {
    let gamma = gamma();
    2.0 * gamma.powi(index) / (gamma + 1.0)
}

/// Duration distribution with exact per-bucket counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DurationHistogram {
    zero_count: u64,
    buckets: BTreeMap<i32, u64>,
}

impl DurationHistogram {
    /// An empty histogram.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sample of `nanos`. Non-positive and NaN samples count as
    /// zero.
    pub fn record(&mut self, nanos: f64) {
        if nanos > 0.0 && nanos.is_finite() {
            *self.buckets.entry(index_of(nanos)).or_default() += 1;
        } else {
            self.zero_count += 1;
        }
    }

    /// Add every sample of `other` to `self`.
    pub fn merge(&mut self, other: &DurationHistogram) {
        self.zero_count += other.zero_count;
        for (index, count) in &other.buckets {
            *self.buckets.entry(*index).or_default() += count;
        }
    }

    /// Add every sample of a serialized histogram.
    pub fn merge_proto(&mut self, other: &Histogram) {
        self.zero_count += other.zero_count;
        for bucket in &other.buckets {
            if bucket.count > 0 {
                *self.buckets.entry(bucket.index).or_default() += bucket.count;
            }
        }
    }

    /// Total number of samples.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.zero_count + self.buckets.values().sum::<u64>()
    }

    /// True if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Estimate the value at quantile `q` in `[0, 1]`, or `None` if empty.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn quantile(&self, q: f64) -> Option<f64> {
        let count = self.count();
        if count == 0 {
            return None;
        }
        let q = q.clamp(0.0, 1.0);
        let rank = (q * (count - 1) as f64).floor() as u64;

        let mut seen = self.zero_count;
        if rank < seen {
            return Some(0.0);
        }
        for (index, bucket) in &self.buckets {
            seen += bucket;
            if rank < seen {
                return Some(value_of(*index));
            }
        }
        self.buckets.keys().next_back().map(|index| value_of(*index))
    }

    /// Serialize, buckets ascending.
    #[must_use]
    pub fn to_proto(&self) -> Histogram {
        Histogram {
            zero_count: self.zero_count,
            buckets: self
                .buckets
                .iter()
                .map(|(index, count)| HistogramBucket {
                    index: *index,
                    count: *count,
                })
                .collect(),
        }
    }
}

impl From<&Histogram> for DurationHistogram {
    fn from(proto: &Histogram) -> Self {
        let mut histogram = Self::new();
        histogram.merge_proto(proto);
        histogram
    }
}
