//! Exponential backoff
//!
//! One policy type serves both the poller (sleep after empty polls) and the
//! stores (delay before a failed task becomes claimable again).

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::util::duration_millis;

/// Injected backoff function: step number to sleep duration
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Exponential backoff with a cap and symmetric jitter
///
/// # Example
///
/// ```
/// use claimq_durable::Backoff;
/// use std::time::Duration;
///
/// let backoff = Backoff::polling().with_jitter(0.0);
///
/// assert_eq!(backoff.delay(1), Duration::from_millis(100));
/// assert_eq!(backoff.delay(2), Duration::from_millis(200));
/// assert_eq!(backoff.delay(20), Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Backoff {
    /// Delay for the first step
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Upper bound before jitter
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth factor per step (e.g., 2.0 for doubling)
    pub multiplier: f64,

    /// Jitter factor (0.0-1.0)
    ///
    /// A value of 0.2 means ±20% randomness.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::polling()
    }
}

impl Backoff {
    /// Poller defaults: 100ms base, 5s cap, doubling, ±20% jitter
    pub fn polling() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// Retry defaults: 1s base, 60s cap, doubling, ±10% jitter
    pub fn retry() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    /// Same delay on every step
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial_interval: interval,
            max_interval: interval,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// No delay at all
    pub fn none() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay for a step without jitter
    ///
    /// Step 0 is no delay; step `n >= 1` is
    /// `initial_interval * multiplier^(n-1)`, capped at `max_interval`.
    pub fn base_delay(&self, step: u32) -> Duration {
        if step == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(step - 1).unwrap_or(i32::MAX);
        let raw = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_interval.as_secs_f64())
        } else {
            self.max_interval.as_secs_f64()
        };
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Delay for a step with jitter drawn from `rng`
    pub fn delay_with<R: Rng + ?Sized>(&self, step: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(step).as_secs_f64();
        if self.jitter <= 0.0 || base == 0.0 {
            return Duration::from_secs_f64(base);
        }
        let range = base * self.jitter;
        let offset = rng.gen_range(-range..=range);
        Duration::from_secs_f64((base + offset).max(0.0))
    }

    /// Delay for a step with thread-local jitter
    pub fn delay(&self, step: u32) -> Duration {
        self.delay_with(step, &mut rand::thread_rng())
    }

    /// Turn the policy into an injectable function
    pub fn into_fn(self) -> BackoffFn {
        Arc::new(move |step| self.delay(step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_polling_defaults() {
        let backoff = Backoff::polling();
        assert_eq!(backoff.initial_interval, Duration::from_millis(100));
        assert_eq!(backoff.max_interval, Duration::from_secs(5));
        assert_eq!(backoff.multiplier, 2.0);
        assert_eq!(backoff.jitter, 0.2);
    }

    #[test]
    fn test_base_delay_doubles_and_caps() {
        let backoff = Backoff::polling();
        assert_eq!(backoff.base_delay(0), Duration::ZERO);
        assert_eq!(backoff.base_delay(1), Duration::from_millis(100));
        assert_eq!(backoff.base_delay(2), Duration::from_millis(200));
        assert_eq!(backoff.base_delay(3), Duration::from_millis(400));
        assert_eq!(backoff.base_delay(7), Duration::from_secs(5));
        assert_eq!(backoff.base_delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff = Backoff::polling();
        let mut rng = StdRng::seed_from_u64(9);
        for step in 1..12 {
            let base = backoff.base_delay(step).as_secs_f64();
            for _ in 0..50 {
                let d = backoff.delay_with(step, &mut rng).as_secs_f64();
                assert!(d >= base * 0.8 - 1e-9 && d <= base * 1.2 + 1e-9);
            }
        }
    }

    #[test]
    fn test_fixed_and_none() {
        let fixed = Backoff::fixed(Duration::from_secs(3));
        assert_eq!(fixed.delay(1), Duration::from_secs(3));
        assert_eq!(fixed.delay(9), Duration::from_secs(3));
        assert_eq!(Backoff::none().delay(4), Duration::ZERO);
    }

    #[test]
    fn test_retry_defaults() {
        let retry = Backoff::retry().with_jitter(0.0);
        assert_eq!(retry.delay(1), Duration::from_secs(1));
        assert_eq!(retry.delay(2), Duration::from_secs(2));
        assert_eq!(retry.delay(3), Duration::from_secs(4));
        assert_eq!(retry.delay(10), Duration::from_secs(60));
    }

    #[test]
    fn test_into_fn() {
        let f = Backoff::fixed(Duration::from_millis(7)).into_fn();
        assert_eq!(f(1), Duration::from_millis(7));
        assert_eq!(f(0), Duration::ZERO);
    }

    #[test]
    fn test_serialization() {
        let backoff = Backoff::retry().with_multiplier(3.0);
        let json = serde_json::to_string(&backoff).unwrap();
        assert!(json.contains("\"initial_interval\":1000"));
        let parsed: Backoff = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, backoff);
    }
}
