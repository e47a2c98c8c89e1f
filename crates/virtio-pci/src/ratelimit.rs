//! Throttled reporting of guest misbehavior.
//!
//! A hostile guest can trigger the same fault on every doorbell. Each reason gets a counter and
//! only occurrences 1, 2, 4, 8, ... are logged, so the log volume grows logarithmically with the
//! number of faults.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RateLimitedWarning {
    count: AtomicU64,
}

impl RateLimitedWarning {
    pub const fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
        }
    }

    /// Records one occurrence. Returns the running total when this occurrence should be logged.
    pub fn record(&self) -> Option<u64> {
        let n = self.count.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        n.is_power_of_two().then_some(n)
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Per-transport counters, one per kind of guest misbehavior.
#[derive(Debug, Default)]
pub(crate) struct GuestWarnings {
    pub chain_too_long: RateLimitedWarning,
    pub chain_too_large: RateLimitedWarning,
    pub descriptor_index: RateLimitedWarning,
    pub avail_overrun: RateLimitedWarning,
    pub feature_select: RateLimitedWarning,
    pub queue_select: RateLimitedWarning,
}

/// Logs a guest-misbehavior warning through `$limiter`, at most on power-of-two occurrences.
macro_rules! warn_guest {
    ($limiter:expr, $($arg:tt)+) => {
        if let Some(occurrences) = $limiter.record() {
            tracing::warn!(occurrences, $($arg)+);
        }
    };
}

pub(crate) use warn_guest;
