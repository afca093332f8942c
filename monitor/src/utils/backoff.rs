//! Exponential backoff for poll loops.
//!
//! Each poll loop owns one [`Backoff`]. Consecutive failures double the delay
//! before the next tick, up to a cap; a single success drops it back to the
//! base interval. Failure delays carry ±25% jitter so sources that fail
//! together do not retry in lockstep.

use std::time::Duration;

use rand::Rng;

/// Jitter factor (±25%).
const JITTER_FACTOR: f64 = 0.25;

/// Delay schedule for one poll loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    failures: u32,
}

impl Backoff {
    /// Creates a schedule starting at `base`, never exceeding `max`.
    ///
    /// A `max` below `base` is raised to `base`.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
            failures: 0,
        }
    }

    /// Delay before the next tick, without jitter.
    #[must_use]
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Number of consecutive failures recorded since the last success.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Delay to actually sleep: the base interval when healthy, the jittered
    /// backoff delay after failures.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        if self.failures == 0 {
            self.current
        } else {
            add_jitter(self.current).min(self.max)
        }
    }

    /// Doubles the delay up to the maximum.
    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
        self.current = self.current.saturating_mul(2).min(self.max);
    }

    /// Resets the delay to the base interval.
    pub fn record_success(&mut self) {
        self.failures = 0;
        self.current = self.base;
    }
}

/// Adds ±25% jitter to a duration.
fn add_jitter(duration: Duration) -> Duration {
    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * JITTER_FACTOR;
    if jitter_range <= 0.0 {
        return duration;
    }
    let jitter = rng.random_range(-jitter_range..=jitter_range);
    Duration::from_secs_f64((duration.as_secs_f64() + jitter).max(0.001))
}
