//! Exponential backoff with jitter.
//!
//! The policy only decides; it never sleeps. [`RetryPolicy::delay_for`] takes
//! the jitter sample as an argument so the schedule is deterministic under
//! test, and the fetch client feeds it from `rand`.

use std::time::Duration;

/// Retry limits and backoff shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Ceiling for computed delays.
    pub max_delay: Duration,
    /// Jitter as a fraction of the delay; `0.25` spreads delays over ±25%.
    pub jitter: f64,
    /// No attempt starts after this much time since the first.
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
            max_elapsed: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Un-jittered delay after `attempt` failed attempts: `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decide whether to try again and how long to wait first.
    ///
    /// * `attempt` - attempts made so far (1 after the first failure)
    /// * `elapsed` - time since the first attempt started
    /// * `retry_after` - server-advertised delay, honoured verbatim when present
    /// * `sample` - uniform jitter sample in `[0, 1)`
    ///
    /// Returns `None` when attempts are exhausted or when waiting would run
    /// past `max_elapsed`.
    pub fn delay_for(
        &self,
        attempt: u32,
        elapsed: Duration,
        retry_after: Option<Duration>,
        sample: f64,
    ) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let delay = match retry_after {
            Some(d) => d,
            None => {
                let base = self.backoff(attempt).as_secs_f64();
                let factor = 1.0 + self.jitter * (2.0 * sample.clamp(0.0, 1.0) - 1.0);
                Duration::from_secs_f64((base * factor).max(0.0))
            }
        };
        if elapsed.saturating_add(delay) > self.max_elapsed {
            return None;
        }
        Some(delay)
    }
}
