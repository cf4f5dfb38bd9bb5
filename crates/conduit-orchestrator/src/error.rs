// Error types for dispatch and orchestration

use crate::config::ConfigError;
use crate::dispatch::FailureRecord;
use crate::routing::SelectionError;
use crate::tasks::DefinitionError;
use conduit_abstraction::ProviderError;
use thiserror::Error;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Orchestration errors
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// Provider call failed
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Circuit breaker rejected the call without invoking the operation
    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen {
        /// Name of the guarded dependency
        name: String,
    },

    /// Every permitted attempt failed with a retryable error
    #[error("Retries exhausted after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
        /// The failure of the final attempt
        #[source]
        last: Box<OrchestrationError>,
    },

    /// No provider satisfied the selection request
    #[error("Provider selection failed: {0}")]
    Selection(#[from] SelectionError),

    /// Every provider in the fallback chain failed
    #[error("All providers failed: {}", summarize_failures(.0))]
    AllProvidersFailed(Vec<FailureRecord>),

    /// Task definition rejected before execution
    #[error("Invalid task definition: {0}")]
    Definition(#[from] DefinitionError),

    /// A task step failed
    #[error("Step '{step_id}' failed: {reason}")]
    StepFailed {
        /// Step identifier
        step_id: String,
        /// Failure description
        reason: String,
    },

    /// Validation of a step result failed
    #[error("Validation failed: {0}")]
    Validation(String),

    /// An agent reported a failure
    #[error("Agent '{agent}' failed: {message}")]
    Agent {
        /// Agent identifier
        agent: String,
        /// Failure description
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Cancelled through the caller's cancellation signal
    #[error("Operation cancelled")]
    Cancelled,

    /// Other error
    #[error("Orchestration error: {0}")]
    Other(String),
}

impl OrchestrationError {
    /// Whether the failure is a transient call failure (timeout, transport).
    ///
    /// This is the default retry predicate.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Whether the dispatcher should move on to the next provider in its fallback chain.
    #[must_use]
    pub fn allows_failover(&self) -> bool {
        match self {
            Self::CircuitOpen { .. } | Self::RetriesExhausted { .. } => true,
            Self::Provider(e) => e.is_transient() || matches!(e, ProviderError::QuotaExceeded { .. }),
            _ => false,
        }
    }

    /// Whether this error is (or wraps) a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled | Self::Provider(ProviderError::Cancelled) => true,
            Self::RetriesExhausted { last, .. } => last.is_cancelled(),
            _ => false,
        }
    }
}

fn summarize_failures(failures: &[FailureRecord]) -> String {
    if failures.is_empty() {
        return "no providers attempted".to_string();
    }
    failures
        .iter()
        .map(|f| format!("{} ({})", f.provider, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_only_for_transport_failures() {
        let transient = OrchestrationError::Provider(ProviderError::Timeout("5s".to_string()));
        assert!(transient.is_transient());

        let logic = OrchestrationError::Validation("empty".to_string());
        assert!(!logic.is_transient());

        let open = OrchestrationError::CircuitOpen { name: "openai".to_string() };
        assert!(!open.is_transient());
    }

    #[test]
    fn test_failover_classification() {
        assert!(OrchestrationError::CircuitOpen { name: "a".to_string() }.allows_failover());
        assert!(
            OrchestrationError::Provider(ProviderError::QuotaExceeded {
                provider: "a".to_string(),
                message: None,
            })
            .allows_failover()
        );
        assert!(
            !OrchestrationError::Provider(ProviderError::InvalidRequest("bad".to_string()))
                .allows_failover()
        );
        assert!(!OrchestrationError::Cancelled.allows_failover());
    }

    #[test]
    fn test_retries_exhausted_wraps_last_cause() {
        let err = OrchestrationError::RetriesExhausted {
            attempts: 3,
            last: Box::new(OrchestrationError::Provider(ProviderError::RequestError(
                "connection reset".to_string(),
            ))),
        };
        let message = err.to_string();
        assert!(message.contains("3 attempt(s)"));
        assert!(message.contains("connection reset"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_all_providers_failed_summary() {
        let err = OrchestrationError::AllProvidersFailed(vec![
            FailureRecord::new("alpha".to_string(), "timeout".to_string()),
            FailureRecord::new("beta".to_string(), "circuit open".to_string()),
        ]);
        assert_eq!(
            err.to_string(),
            "All providers failed: alpha (timeout); beta (circuit open)"
        );
    }
}
