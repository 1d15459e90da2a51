//! Circuit breaker: named failure-counting gates around a callable.
//!
//! Breakers here are purely in-process rather than shared across hosts
//! through a database row, since this engine runs as a single embedded
//! process with nothing external to coordinate against.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration for a step's `circuit_breaker` option.
///
/// # Example
///
/// ```
/// use workflow_engine::reliability::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::new("payments-api")
///     .with_failure_threshold(3)
///     .with_recovery_timeout(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    pub name: String,
    pub failure_threshold: u32,
    #[serde(with = "super::retry::duration_millis")]
    pub recovery_timeout: Duration,
    /// Allow-list of error substrings that count toward opening the
    /// breaker. `None` means any failure counts.
    pub expected_errors: Option<Vec<String>>,
}

impl CircuitBreakerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            expected_errors: None,
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_expected_errors(mut self, errors: Vec<String>) -> Self {
        self.expected_errors = Some(errors);
        self
    }

    fn counts_toward_opening(&self, error_message: &str) -> bool {
        match &self.expected_errors {
            None => true,
            Some(patterns) => patterns
                .iter()
                .any(|p| error_message.to_lowercase().contains(&p.to_lowercase())),
        }
    }
}

#[derive(Debug, Error)]
pub enum CircuitBreakerError {
    #[error("circuit breaker '{0}' is open")]
    Open(String),
}

struct BreakerInner {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

/// One named, stateful breaker. Cheaply cloneable (wraps an `Arc<Mutex<_>>`).
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Mutex<BreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BreakerInner {
                config,
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            })),
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    fn maybe_transition_to_half_open(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= inner.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                }
            }
        }
    }

    /// Check whether a call may proceed right now. Does not itself record
    /// anything; callers must follow up with `record_success`/
    /// `record_failure`.
    pub fn allow(&self) -> Result<(), CircuitBreakerError> {
        let mut inner = self.inner.lock();
        self.maybe_transition_to_half_open(&mut inner);
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => Err(CircuitBreakerError::Open(inner.config.name.clone())),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.success_count = 0;
                inner.opened_at = None;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, error_message: &str) {
        let mut inner = self.inner.lock();
        if !inner.config.counts_toward_opening(error_message) {
            return;
        }
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= inner.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Open => {}
        }
    }

    /// Run `f` through the breaker: rejects immediately if open, otherwise
    /// invokes `f` and records the outcome.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerOutcome<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.allow().map_err(BreakerOutcome::Open)?;
        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure(&err.to_string());
                Err(BreakerOutcome::Inner(err))
            }
        }
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        BreakerStats {
            name: inner.config.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            opened_at: inner.opened_at.map(|_| Utc::now()),
        }
    }
}

/// Outcome of running a callable through `CircuitBreaker::execute`.
#[derive(Debug, Error)]
pub enum BreakerOutcome<E: std::fmt::Display> {
    #[error("circuit breaker open")]
    Open(CircuitBreakerError),
    #[error("{0}")]
    Inner(E),
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

/// Registry of named breakers, auto-creating on first use. `execute(name,
/// fn)` is the single entry point.
#[derive(Clone, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<DashMap<String, CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or lazily create, with `config`) the named breaker.
    pub fn get_or_create(&self, config: CircuitBreakerConfig) -> CircuitBreaker {
        self.breakers
            .entry(config.name.clone())
            .or_insert_with(|| CircuitBreaker::new(config))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.breakers.get(name).map(|b| b.clone())
    }

    pub fn all_stats(&self) -> Vec<BreakerStats> {
        self.breakers.iter().map(|b| b.stats()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_failure_threshold() {
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::new("svc").with_failure_threshold(3),
        );
        for _ in 0..3 {
            breaker.record_failure("boom");
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.allow().is_err());
    }

    #[test]
    fn half_open_after_recovery_timeout() {
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::new("svc")
                .with_failure_threshold(1)
                .with_recovery_timeout(Duration::from_millis(10)),
        );
        breaker.record_failure("boom");
        assert_eq!(breaker.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.allow().is_ok());
    }

    #[test]
    fn half_open_success_closes_and_resets() {
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::new("svc")
                .with_failure_threshold(1)
                .with_recovery_timeout(Duration::from_millis(1)),
        );
        breaker.record_failure("boom");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::new("svc")
                .with_failure_threshold(1)
                .with_recovery_timeout(Duration::from_millis(1)),
        );
        breaker.record_failure("boom");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_failure("boom again");
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn expected_errors_filter_what_counts() {
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::new("svc")
                .with_failure_threshold(1)
                .with_expected_errors(vec!["timeout".into()]),
        );
        breaker.record_failure("invalid input");
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure("upstream timeout");
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn registry_auto_creates_and_reuses() {
        let registry = CircuitBreakerRegistry::new();
        let a = registry.get_or_create(CircuitBreakerConfig::new("svc"));
        a.record_failure("x");
        let b = registry.get_or_create(CircuitBreakerConfig::new("svc"));
        assert_eq!(b.stats().failure_count, 1);
    }
}
