//! Resilience decorators: circuit breaking and retry with backoff.
//!
//! Both wrap any async callable and compose by nesting. The dispatcher puts the
//! breaker outermost so an open circuit never starts a retry loop.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStatistics,
    CircuitState, CircuitStateChange,
};
pub use retry::{BackoffStrategy, RetryConfig, RetryPolicy, RetryPredicate};
