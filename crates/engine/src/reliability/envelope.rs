//! Execution Envelope: composes timeout, retry-with-backoff, circuit
//! breaker gating, and fallback around a single handler invocation.
//!
//! Since handlers run in-process rather than being claimed off a remote
//! queue, a direct `tokio::time::timeout` around the future stands in for
//! polling a store for stale tasks.

use std::future::Future;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use super::retry::RetryPolicy;
use crate::model::step::{RetryOn, RetryOptions};

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),
    #[error("handler failed: {0}")]
    HandlerFailed(String),
}

/// Outcome of running a handler through the envelope, whether it
/// ultimately succeeded or not.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult<T> {
    pub success: bool,
    pub output: Option<T>,
    pub error: Option<String>,
    pub attempts: u32,
    #[serde(skip)]
    pub total_duration: Duration,
    #[serde(skip)]
    pub retry_delays: Vec<Duration>,
}

impl<T> ExecutionResult<T> {
    /// A successful result produced outside of an [`Envelope`] (e.g. by a
    /// [`crate::dispatcher::JobRunner`] that has no retries of its own to
    /// report).
    pub fn ok(output: T) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            attempts: 1,
            total_duration: Duration::ZERO,
            retry_delays: Vec::new(),
        }
    }

    /// A failed result produced outside of an [`Envelope`].
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(message.into()),
            attempts: 1,
            total_duration: Duration::ZERO,
            retry_delays: Vec::new(),
        }
    }
}

/// Default pattern matched against an error's `Display` output when no
/// `retry_on` selector is configured. Covers both POSIX-style error codes
/// (`ECONNRESET`, `ETIMEDOUT`, ...) and the common English phrasing
/// wrapping handler errors tend to use.
const DEFAULT_TRANSIENT_PATTERNS: &[&str] = &[
    "econnreset",
    "econnrefused",
    "enotfound",
    "etimedout",
    "enetunreach",
    "epipe",
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "connection",
    "network",
    "broken pipe",
    "temporarily unavailable",
    "server error",
    "service unavailable",
    "internal server error",
];

/// Composes timeout + retry + circuit-breaker + fallback around a
/// fallible, cloneable handler closure.
pub struct Envelope {
    pub retry: Option<RetryOptions>,
    pub timeout: Option<Duration>,
    pub circuit_breaker: Option<CircuitBreaker>,
    /// Fallback handler name; the interpreter resolves and invokes it
    /// after retries are exhausted. The envelope itself only reports
    /// that a fallback was requested via `EnvelopeError`.
    pub on_error: Option<String>,
}

impl Envelope {
    pub fn new() -> Self {
        Self {
            retry: None,
            timeout: None,
            circuit_breaker: None,
            on_error: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    pub fn with_on_error(mut self, handler: impl Into<String>) -> Self {
        self.on_error = Some(handler.into());
        self
    }

    /// Run `make_attempt` (invoked once per attempt, producing a fresh
    /// future each time) to completion, honoring retry/timeout/breaker
    /// configuration.
    ///
    /// Circuit breaker gating happens first and is never retried: an
    /// open breaker fails the step immediately regardless of `retry`.
    pub async fn execute<F, Fut, T, E>(&self, mut make_attempt: F) -> ExecutionResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let start = Instant::now();

        if let Some(breaker) = &self.circuit_breaker {
            if breaker.allow().is_err() {
                return ExecutionResult {
                    success: false,
                    output: None,
                    error: Some(EnvelopeError::CircuitOpen.to_string()),
                    attempts: 0,
                    total_duration: start.elapsed(),
                    retry_delays: Vec::new(),
                };
            }
        }

        let max_attempts = self.retry.as_ref().map(|r| r.attempts).unwrap_or(1).max(1);
        let mut retry_delays = Vec::new();
        let mut last_error: Option<String> = None;

        for attempt in 1..=max_attempts {
            let attempt_result = match self.timeout {
                Some(timeout) => match tokio::time::timeout(timeout, make_attempt()).await {
                    Ok(inner) => inner.map_err(|e| e.to_string()),
                    Err(_) => Err(EnvelopeError::Timeout(timeout).to_string()),
                },
                None => make_attempt().await.map_err(|e| e.to_string()),
            };

            match attempt_result {
                Ok(output) => {
                    if let Some(breaker) = &self.circuit_breaker {
                        breaker.record_success();
                    }
                    return ExecutionResult {
                        success: true,
                        output: Some(output),
                        error: None,
                        attempts: attempt,
                        total_duration: start.elapsed(),
                        retry_delays,
                    };
                }
                Err(message) => {
                    if let Some(breaker) = &self.circuit_breaker {
                        breaker.record_failure(&message);
                    }
                    last_error = Some(message.clone());

                    let retryable = attempt < max_attempts
                        && self.is_retryable(&message, self.retry.as_ref());
                    if !retryable {
                        break;
                    }

                    let backoff = self
                        .retry
                        .as_ref()
                        .map(|r| &r.backoff)
                        .cloned()
                        .unwrap_or_else(|| RetryPolicy::fixed(Duration::from_millis(0)));
                    let delay = backoff.delay_for_attempt(attempt);
                    retry_delays.push(delay);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        ExecutionResult {
            success: false,
            output: None,
            error: last_error,
            attempts: max_attempts,
            total_duration: start.elapsed(),
            retry_delays,
        }
    }

    /// Resolution order: an explicit `retry_on` predicate-like
    /// selector wins if present (error pattern substrings, then status
    /// codes embedded in the message as `status:<code>`); otherwise fall
    /// back to matching common transient-network phrasing.
    fn is_retryable(&self, message: &str, retry: Option<&RetryOptions>) -> bool {
        let Some(retry_on) = retry.and_then(|r| r.retry_on.as_ref()) else {
            return Self::matches_default_transient(message);
        };
        if Self::matches_error_patterns(message, retry_on) {
            return true;
        }
        if Self::matches_status_codes(message, retry_on) {
            return true;
        }
        false
    }

    fn matches_error_patterns(message: &str, retry_on: &RetryOn) -> bool {
        if retry_on.error_patterns.is_empty() {
            return false;
        }
        let lowered = message.to_lowercase();
        retry_on
            .error_patterns
            .iter()
            .any(|pattern| lowered.contains(&pattern.to_lowercase()))
    }

    fn matches_status_codes(message: &str, retry_on: &RetryOn) -> bool {
        if retry_on.status_codes.is_empty() {
            return false;
        }
        retry_on
            .status_codes
            .iter()
            .any(|code| message.contains(&format!("status:{code}")))
    }

    fn matches_default_transient(message: &str) -> bool {
        let lowered = message.to_lowercase();
        DEFAULT_TRANSIENT_PATTERNS
            .iter()
            .any(|pattern| lowered.contains(pattern))
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}
