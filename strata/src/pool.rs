//! Worker pool sizing from observed pass durations.

use std::time::Duration;

/// Grows the pool after a run of slow passes and shrinks it after a run of
/// fast ones. The size changes only between passes.
#[derive(Debug, Clone)]
pub struct PoolSizer {
    min: usize,
    max: usize,
    current: usize,
    slow: Duration,
    fast: Duration,
    after: u32,
    slow_streak: u32,
    fast_streak: u32,
}

impl PoolSizer {
    /// A sizer starting at `min` workers.
    ///
    /// `after` consecutive passes slower than `slow` add a worker and as many
    /// faster than `fast` remove one, always within `[min, max]`.
    #[must_use]
    pub fn new(min: usize, max: usize, slow: Duration, fast: Duration, after: u32) -> Self {
        let min = min.max(1);
        Self {
            min,
            max: max.max(min),
            current: min,
            slow,
            fast,
            after: after.max(1),
            slow_streak: 0,
            fast_streak: 0,
        }
    }

    /// Workers to use for the next pass.
    #[must_use]
    pub fn current(&self) -> usize {
        self.current
    }

    /// Record a finished pass and return the size for the next one.
    pub fn observe(&mut self, elapsed: Duration) -> usize {
        if elapsed >= self.slow {
            self.slow_streak += 1;
            self.fast_streak = 0;
        } else if elapsed <= self.fast {
            self.fast_streak += 1;
            self.slow_streak = 0;
        } else {
            self.slow_streak = 0;
            self.fast_streak = 0;
        }

        if self.slow_streak >= self.after {
            self.slow_streak = 0;
            self.current = (self.current + 1).min(self.max);
        } else if self.fast_streak >= self.after {
            self.fast_streak = 0;
            self.current = self.current.saturating_sub(1).max(self.min);
        }
        self.current
    }
}
