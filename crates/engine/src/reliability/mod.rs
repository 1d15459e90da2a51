//! Reliability patterns for durable execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Configurable retry with exponential backoff
//! - [`CircuitBreakerConfig`] / [`CircuitBreaker`] / [`CircuitBreakerRegistry`] - Circuit breaking
//! - [`Envelope`] - Composes timeout, retry, circuit breaker and fallback around a handler call

mod circuit_breaker;
mod envelope;
mod retry;

pub use circuit_breaker::{
    BreakerOutcome, BreakerStats, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError,
    CircuitBreakerRegistry, CircuitState,
};
pub use envelope::{Envelope, EnvelopeError, ExecutionResult};
pub use retry::{BackoffStrategy, RetryPolicy};
