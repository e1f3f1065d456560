//! Exponential backoff as a pure function plus an explicit deadline.
//!
//! Retry loops never compute their own sleeps: they ask a [`BackoffPolicy`]
//! for the delay of attempt `n` and stop when the policy's schedule runs out
//! or a [`Deadline`] passes. Both are testable without sleeping.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::types::Timestamp;

/// Exponential backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base: Duration,
    /// Growth factor applied per attempt
    pub multiplier: u32,
    /// Upper bound for a single delay
    pub cap: Duration,
    /// Maximum number of delays in a schedule
    pub max_attempts: u32,
    /// No new delay starts once this much time has been spent waiting
    pub max_total: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(50),
            multiplier: 2,
            cap: Duration::from_millis(200),
            max_attempts: 5,
            max_total: Duration::from_millis(500),
        }
    }
}

impl BackoffPolicy {
    /// Delay for the zero-based `attempt`: `base * multiplier^attempt`, capped.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// The full sequence of delays a retry loop may sleep.
    ///
    /// A delay is only yielded while the time already waited is below
    /// `max_total`, so the total is bounded by `max_total + cap`.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        let mut waited = Duration::ZERO;
        (0..self.max_attempts).map_while(move |attempt| {
            if waited >= self.max_total {
                return None;
            }
            let delay = self.next_delay(attempt);
            waited = waited.saturating_add(delay);
            Some(delay)
        })
    }

    /// Sum of every delay in [`schedule`](Self::schedule).
    pub fn total_wait(&self) -> Duration {
        self.schedule().fold(Duration::ZERO, Duration::saturating_add)
    }
}

/// A point after which a retry loop must give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Timestamp,
}

impl Deadline {
    /// A deadline `limit` after the clock's current time.
    pub fn after(clock: &dyn Clock, limit: Duration) -> Self {
        Self {
            at: clock.now().saturating_add(limit),
        }
    }

    /// The instant the deadline falls on.
    pub const fn at(&self) -> Timestamp {
        self.at
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self, clock: &dyn Clock) -> bool {
        clock.now() >= self.at
    }

    /// Time left, zero once expired.
    pub fn remaining(&self, clock: &dyn Clock) -> Duration {
        self.at.duration_since(clock.now())
    }
}
