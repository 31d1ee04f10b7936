//! Thread resource counter merging.

use crate::proto::ThreadStats;

/// Combine two counters where `None` means "not recorded".
///
/// A recorded value always wins over an unrecorded one. Unrecorded is never
/// read as zero: rows from agents that never captured the counter must not
/// drag an average down.
#[must_use]
pub fn merge_counter(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a + b),
        (Some(v), None) | (None, Some(v)) => Some(v),
        (None, None) => None,
    }
}

impl ThreadStats {
    /// Fold `other` into `self` counter by counter.
    pub fn merge(&mut self, other: &ThreadStats) {
        self.cpu_nanos = merge_counter(self.cpu_nanos, other.cpu_nanos);
        self.blocked_nanos = merge_counter(self.blocked_nanos, other.blocked_nanos);
        self.waited_nanos = merge_counter(self.waited_nanos, other.waited_nanos);
        self.allocated_bytes = merge_counter(self.allocated_bytes, other.allocated_bytes);
    }

    /// True if no counter was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cpu_nanos.is_none()
            && self.blocked_nanos.is_none()
            && self.waited_nanos.is_none()
            && self.allocated_bytes.is_none()
    }
}

/// Merge optional stats blocks, keeping `None` when neither side has any.
pub(crate) fn merge_optional(into: &mut Option<ThreadStats>, other: Option<&ThreadStats>) {
    let Some(other) = other else { return };
    match into {
        Some(stats) => stats.merge(other),
        None => *into = Some(*other),
    }
}
