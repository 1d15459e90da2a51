//! Retry backoff policy.
//!
//! This is the `backoff` object of a step's `retry` option: a strategy
//! (`fixed`/`linear`/`exponential`), a base `delay`, a `maxDelay` clamp, a
//! `multiplier`, and an optional jitter toggle.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff strategy for computing the delay before retry `attempt`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
}

/// Configuration for a step's retry backoff.
///
/// # Example
///
/// ```
/// use workflow_engine::reliability::{RetryPolicy, BackoffStrategy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(BackoffStrategy::Exponential, Duration::from_millis(10))
///     .with_multiplier(2.0)
///     .with_max_delay(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub strategy: BackoffStrategy,
    #[serde(with = "duration_millis")]
    pub delay: Duration,
    /// Clamp applied after the strategy formula. Defaults to `10 * delay`
    /// when constructed via [`RetryPolicy::new`].
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Only meaningful for `linear`/`exponential`; defaults to 2.0.
    pub multiplier: f64,
    /// Whether to jitter the computed delay. Defaults to on.
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(strategy: BackoffStrategy, delay: Duration) -> Self {
        Self {
            strategy,
            delay,
            max_delay: delay.saturating_mul(10),
            multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(BackoffStrategy::Fixed, delay)
    }

    pub fn linear(delay: Duration) -> Self {
        Self::new(BackoffStrategy::Linear, delay)
    }

    pub fn exponential(delay: Duration) -> Self {
        Self::new(BackoffStrategy::Exponential, delay)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Compute the delay before retry attempt `attempt` (1-based: `attempt`
    /// is the number of the attempt that just failed, so the first retry
    /// delay is `delay_for_attempt(1)`).
    ///
    /// - `fixed`: `delay`.
    /// - `linear`: `delay * (1 + (attempt-1) * multiplier)`.
    /// - `exponential`: `delay * multiplier^(attempt-1)`.
    /// - clamp to `max_delay`.
    /// - if `jitter`, multiply by a uniform factor in `[0.5, 1.5)` and floor.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.delay.as_millis() as f64;
        let n = attempt.saturating_sub(1) as f64;
        let raw_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Linear => base_ms * (1.0 + n * self.multiplier),
            BackoffStrategy::Exponential => base_ms * self.multiplier.powf(n),
        };
        let capped_ms = raw_ms.min(self.max_delay.as_millis() as f64);

        let final_ms = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            (capped_ms * factor).floor()
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms.max(0.0) as u64)
    }
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_strategy_is_constant() {
        let policy = RetryPolicy::fixed(Duration::from_millis(10)).with_jitter(false);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10));
    }

    #[test]
    fn linear_strategy_grows_additively() {
        let policy = RetryPolicy::linear(Duration::from_millis(10))
            .with_multiplier(1.0)
            .with_jitter(false);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(30));
    }

    #[test]
    fn exponential_strategy_doubles() {
        let policy = RetryPolicy::exponential(Duration::from_millis(10))
            .with_max_delay(Duration::from_secs(100))
            .with_jitter(false);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(40));
    }

    #[test]
    fn delay_clamps_to_max_delay() {
        let policy = RetryPolicy::exponential(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(25))
            .with_jitter(false);
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(25));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::fixed(Duration::from_millis(100));
        for _ in 0..200 {
            let d = policy.delay_for_attempt(1).as_millis();
            assert!(d >= 50 && d < 150, "jittered delay {d} out of [50,150)");
        }
    }

    #[test]
    fn default_max_delay_is_ten_times_delay() {
        let policy = RetryPolicy::fixed(Duration::from_millis(10));
        assert_eq!(policy.max_delay, Duration::from_millis(100));
    }

    #[test]
    fn serialization_round_trips() {
        let policy = RetryPolicy::exponential(Duration::from_millis(50)).with_jitter(false);
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }
}
