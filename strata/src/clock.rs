//! Wall clock access for the driver loop.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

/// Source of the current time and of delays.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Milliseconds since the epoch.
    fn now_millis(&self) -> i64;
    /// Wait for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// A clock that operates with respect to real wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

#[async_trait]
impl Clock for RealClock {
    fn now_millis(&self) -> i64 {
        // A clock before the epoch reads as the epoch.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Delay from `now` until the next pass, which starts `offset` after an
/// `interval` boundary. A pass never starts exactly at `now`.
#[must_use]
pub fn next_pass_delay(now: i64, interval: i64, offset: i64) -> Duration {
    if interval <= 0 {
        return Duration::ZERO;
    }
    let next = ((now - offset).div_euclid(interval) + 1) * interval + offset;
    Duration::from_millis(u64::try_from(next - now).unwrap_or(0))
}
