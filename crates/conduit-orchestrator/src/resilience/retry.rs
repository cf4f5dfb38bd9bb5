//! Bounded retry with backoff.

use crate::error::{OrchestrationError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Maximum jitter added on top of an exponential delay, as a fraction of it.
const MAX_JITTER: f64 = 0.3;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Always `initial_delay`.
    Fixed,
    /// `initial_delay × attempt`.
    Linear,
    /// `initial_delay × 2^(attempt - 1)`.
    Exponential,
}

/// Retry tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Base delay.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Delay growth.
    pub backoff: BackoffStrategy,
    /// Randomize exponential delays by up to 30%.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff: BackoffStrategy::Exponential,
            jitter: true,
        }
    }
}

/// Decides whether a failure is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&OrchestrationError) -> bool + Send + Sync>;

/// Wraps a callable with bounded, backed-off re-attempts.
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    predicate: RetryPredicate,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Creates a policy that retries transient failures only.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config, predicate: Arc::new(OrchestrationError::is_transient) }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self::new(RetryConfig { max_attempts: 1, ..RetryConfig::default() })
    }

    /// Replaces the retry predicate.
    #[must_use]
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&OrchestrationError) -> bool + Send + Sync + 'static,
    {
        self.predicate = Arc::new(predicate);
        self
    }

    /// The configuration in use.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Whether `error` would be retried (attempt budget aside).
    pub fn should_retry(&self, error: &OrchestrationError) -> bool {
        !error.is_cancelled() && (self.predicate)(error)
    }

    /// Delay to wait after attempt `attempt` (1-based) fails, before the next one.
    ///
    /// # Arguments
    /// * `attempt` - Number of the attempt that just failed
    ///
    /// # Returns
    /// The backoff delay, jittered when enabled, never above `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let initial = self.config.initial_delay;

        let base = match self.config.backoff {
            BackoffStrategy::Fixed => initial,
            BackoffStrategy::Linear => initial.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                initial.saturating_mul(factor)
            }
        };

        let delay = if self.config.jitter && self.config.backoff == BackoffStrategy::Exponential {
            let fraction = rand::thread_rng().gen_range(0.0..=MAX_JITTER);
            base.saturating_add(base.mul_f64(fraction.min(MAX_JITTER)))
        } else {
            base
        };

        delay.min(self.config.max_delay)
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget runs out.
    ///
    /// The operation receives the 1-based attempt number. Waits between attempts end
    /// immediately when `cancellation` trips.
    ///
    /// # Errors
    /// Non-retryable failures are returned unchanged. Exhausting the budget on a
    /// retryable failure returns `OrchestrationError::RetriesExhausted` wrapping it.
    /// A tripped cancellation returns `OrchestrationError::Cancelled`.
    pub async fn execute<F, Fut, T>(
        &self,
        cancellation: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            if cancellation.is_cancelled() {
                return Err(OrchestrationError::Cancelled);
            }

            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !self.should_retry(&error) {
                debug!(attempt, error = %error, "Failure is not retryable");
                return Err(error);
            }

            if attempt >= max_attempts {
                warn!(attempts = attempt, error = %error, "Retries exhausted");
                return Err(OrchestrationError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let delay = self.delay_for_attempt(attempt);
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after transient failure"
            );

            tokio::select! {
                () = cancellation.cancelled() => return Err(OrchestrationError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
