//! Bounded exponential backoff with symmetric jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Default growth factor between attempts.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Default jitter as a fraction of the clamped delay.
pub const DEFAULT_JITTER: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            multiplier: DEFAULT_MULTIPLIER,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based), with random jitter.
    pub fn delay(&self, attempt: u32, base: Duration, max: Duration) -> Duration {
        let sample = if self.jitter > 0.0 {
            rand::rng().random_range(-1.0..=1.0)
        } else {
            0.0
        };
        self.delay_with_sample(attempt, base, max, sample)
    }

    /// Same as [`delay`](Self::delay) with the jitter sample in `[-1, 1]`
    /// supplied by the caller.
    pub fn delay_with_sample(
        &self,
        attempt: u32,
        base: Duration,
        max: Duration,
        sample: f64,
    ) -> Duration {
        let base_ms = base.as_millis() as f64;
        let clamped = self.unjittered(attempt, base, max).as_millis() as f64;
        let jittered = clamped + clamped * self.jitter * sample.clamp(-1.0, 1.0);
        Duration::from_millis(jittered.max(base_ms).round() as u64)
    }

    /// `base * multiplier^(attempt-1)` clamped to `max`.
    pub fn unjittered(&self, attempt: u32, base: Duration, max: Duration) -> Duration {
        let exponent = attempt.max(1) - 1;
        let factor = self.multiplier.powi(exponent.min(i32::MAX as u32) as i32);
        let raw = base.as_millis() as f64 * factor;
        let capped = raw.min(max.as_millis() as f64);
        if capped.is_finite() {
            Duration::from_millis(capped as u64)
        } else {
            max
        }
    }
}

/// Convenience wrapper with the default multiplier and jitter.
pub fn compute_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    BackoffPolicy::default().delay(attempt, base, max)
}
