//! Bounded exponential backoff for conditional writes.

use std::time::Duration;
use rand::Rng;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub initial_delay:  Duration,
    pub max_delay:      Duration,
    pub backoff_factor: f64,
    /// Fraction of the delay, within [0, 1].
    pub jitter_percent: f64,
    /// Total attempts including the first one.
    pub max_attempts:   u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay:  Duration::from_millis(50),
            max_delay:      Duration::from_secs(2),
            backoff_factor: 2.0,
            jitter_percent: 0.2,
            max_attempts:   6,
        }
    }
}

impl RetryPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay:  initial_delay,
            max_delay:      max_delay.max(initial_delay),
            max_attempts:   max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial = self.initial_delay.as_secs_f64();
        let max     = self.max_delay.as_secs_f64();

        let exp  = attempt.min(31) as i32;
        let base = (initial * self.backoff_factor.max(1.0).powi(exp)).min(max);

        let jitter = self.jitter_percent.clamp(0.0, 1.0) * base;
        let delay  = if jitter > 0.0 {
            base + rand::rng().random_range(-jitter..=jitter)
        } else {
            base
        };

        Duration::from_secs_f64(delay.clamp(0.0, max))
    }
}
