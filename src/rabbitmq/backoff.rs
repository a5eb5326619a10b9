//! Exponential backoff shared by the reconnection supervisor and the publisher.
//!
//! The delay for attempt `n` (0-indexed) is `initial × 2^n`, capped at `max`.
//! Jitter, when enabled, is applied to the capped value and never feeds back
//! into later attempts.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay after the first failed attempt.
    pub initial: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    /// Fraction of the delay to randomize by, in `[0.0, 1.0]`. Zero disables jitter.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.0,
        }
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base = 2u32
            .checked_pow(attempt)
            .and_then(|factor| self.initial.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max));

        if self.jitter <= 0.0 {
            return base;
        }

        // Spread evenly over [base × (1 - jitter), base × (1 + jitter)].
        let spread = (rand::random::<f64>() * 2.0 - 1.0) * self.jitter;
        base.mul_f64((1.0 + spread).max(0.0))
    }
}
