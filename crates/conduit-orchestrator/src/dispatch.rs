//! Resilient provider dispatch.
//!
//! Builds a fallback chain from the selector, then invokes each candidate through its
//! circuit breaker (outermost) and the retry policy (innermost). Every attempt is
//! recorded into the health monitor exactly once.

use crate::config::ConduitConfig;
use crate::error::{OrchestrationError, Result};
use crate::resilience::{CircuitBreakerRegistry, RetryPolicy};
use crate::routing::{
    HealthMonitor, ProviderCandidate, ProviderRegistry, ProviderSelector, SelectionContext,
    SelectionStrategy,
};
use chrono::{DateTime, Utc};
use conduit_abstraction::{ProviderError, ProviderRequest, ProviderResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A provider that failed while working through a fallback chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Provider name.
    pub provider: String,
    /// Error description.
    pub error: String,
    /// When the provider was given up on.
    pub timestamp: DateTime<Utc>,
}

impl FailureRecord {
    /// Creates a record stamped with the current time.
    pub fn new(provider: String, error: String) -> Self {
        Self { provider, error, timestamp: Utc::now() }
    }
}

/// Dispatcher tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Strategy used by `dispatch_default`.
    pub default_strategy: SelectionStrategy,
    /// Maximum providers tried per dispatch.
    pub fallback_count: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { default_strategy: SelectionStrategy::Priority, fallback_count: 3 }
    }
}

/// A successful dispatch.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Provider that produced the response.
    pub provider: String,
    /// The response.
    pub response: ProviderResponse,
    /// Attempts made against the successful provider.
    pub attempts: u32,
    /// Wall time of the whole dispatch, failovers included.
    pub elapsed: Duration,
    /// Providers that failed before this one.
    pub failed_over: Vec<FailureRecord>,
}

/// Invokes providers through selection, circuit breaking, and retry.
#[derive(Debug)]
pub struct ProviderDispatcher {
    selector: Arc<ProviderSelector>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryPolicy,
    config: DispatchConfig,
}

impl ProviderDispatcher {
    /// Creates a dispatcher.
    ///
    /// # Arguments
    /// * `selector` - Provider selector (also supplies the health monitor)
    /// * `breakers` - One breaker per provider
    /// * `retry` - Retry policy applied inside each breaker
    /// * `config` - Strategy and fallback depth
    pub fn new(
        selector: Arc<ProviderSelector>,
        breakers: Arc<CircuitBreakerRegistry>,
        retry: RetryPolicy,
        config: DispatchConfig,
    ) -> Self {
        Self { selector, breakers, retry, config }
    }

    /// Wires a dispatcher over `registry` from loaded configuration.
    pub fn from_config(registry: Arc<ProviderRegistry>, config: &ConduitConfig) -> Self {
        let health = Arc::new(HealthMonitor::new(config.health.clone()));
        let selector = Arc::new(ProviderSelector::new(registry, health));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.to_config()));
        Self::new(selector, breakers, RetryPolicy::new(config.retry.to_config()), config.dispatch.clone())
    }

    /// The selector used to build fallback chains.
    pub fn selector(&self) -> &Arc<ProviderSelector> {
        &self.selector
    }

    /// The health monitor every attempt is recorded into.
    pub fn health(&self) -> &Arc<HealthMonitor> {
        self.selector.health()
    }

    /// The per-provider circuit breakers.
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// The configuration in use.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Dispatches with the configured default strategy.
    pub async fn dispatch_default(
        &self,
        context: &SelectionContext,
        request: &ProviderRequest,
        cancellation: &CancellationToken,
    ) -> Result<DispatchOutcome> {
        self.dispatch(self.config.default_strategy, context, request, cancellation).await
    }

    /// Dispatches `request` to the best provider, failing over along the chain.
    ///
    /// The Specific strategy never fails over to another provider.
    ///
    /// # Errors
    /// * `Selection` if no provider qualifies
    /// * `Cancelled` if `cancellation` trips
    /// * The first non-failover error (e.g. an invalid request) unchanged
    /// * `AllProvidersFailed` with one record per attempted provider otherwise
    pub async fn dispatch(
        &self,
        strategy: SelectionStrategy,
        context: &SelectionContext,
        request: &ProviderRequest,
        cancellation: &CancellationToken,
    ) -> Result<DispatchOutcome> {
        let started = Instant::now();
        let depth = if strategy == SelectionStrategy::Specific {
            1
        } else {
            self.config.fallback_count.max(1)
        };
        let chain = self.selector.select_providers(strategy, depth, context)?;

        let mut failures: Vec<FailureRecord> = Vec::new();
        for candidate in chain {
            if cancellation.is_cancelled() {
                return Err(OrchestrationError::Cancelled);
            }

            match self.invoke_candidate(&candidate, request, cancellation).await {
                Ok((response, attempts)) => {
                    info!(
                        provider = %candidate.name(),
                        attempts,
                        failovers = failures.len(),
                        "Dispatch succeeded"
                    );
                    return Ok(DispatchOutcome {
                        provider: candidate.name().to_string(),
                        response,
                        attempts,
                        elapsed: started.elapsed(),
                        failed_over: failures,
                    });
                }
                Err(e) if e.is_cancelled() => return Err(OrchestrationError::Cancelled),
                Err(e) if e.allows_failover() => {
                    warn!(provider = %candidate.name(), error = %e, "Provider failed, trying next in chain");
                    failures.push(FailureRecord::new(candidate.name().to_string(), e.to_string()));
                }
                Err(e) => {
                    warn!(provider = %candidate.name(), error = %e, "Provider failed with non-recoverable error");
                    return Err(e);
                }
            }
        }

        Err(OrchestrationError::AllProvidersFailed(failures))
    }

    /// Runs one candidate as breaker(retry(invoke)).
    async fn invoke_candidate(
        &self,
        candidate: &ProviderCandidate,
        request: &ProviderRequest,
        cancellation: &CancellationToken,
    ) -> Result<(ProviderResponse, u32)> {
        let name = candidate.name();
        let breaker = self.breakers.get_or_create(name);
        let health = self.selector.health();
        let attempts = AtomicU32::new(0);

        let response = breaker
            .execute(|| {
                self.retry.execute(cancellation, |attempt| {
                    attempts.store(attempt, Ordering::Relaxed);
                    let handle = Arc::clone(&candidate.handle);
                    async move {
                        let started = Instant::now();
                        let outcome = handle.invoke(request, cancellation).await;
                        let elapsed = started.elapsed();
                        match outcome {
                            Ok(response) => {
                                health.record_outcome(name, true, elapsed);
                                Ok(response)
                            }
                            Err(ProviderError::Cancelled) => Err(OrchestrationError::Cancelled),
                            Err(error) => {
                                health.record_outcome(name, false, elapsed);
                                debug!(provider = %name, attempt, error = %error, "Provider call failed");
                                Err(OrchestrationError::Provider(error))
                            }
                        }
                    }
                })
            })
            .await?;

        Ok((response, attempts.load(Ordering::Relaxed)))
    }
}
