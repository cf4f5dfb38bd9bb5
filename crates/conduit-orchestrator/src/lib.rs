//! Dispatch and orchestration core for Conduit.
//!
//! Provider calls flow through [`ProviderSelector`] (health-aware ranking over the
//! [`ProviderRegistry`]), then a per-provider [`CircuitBreaker`] wrapping a
//! [`RetryPolicy`]. On top of that, [`TaskOrchestrator`] runs multi-step tasks and
//! [`MultiAgentCoordinator`] runs one task across several [`Agent`]s.

pub mod agents;
pub mod config;
pub mod coordination;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod resilience;
pub mod routing;
pub mod tasks;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

pub use agents::ProviderAgent;
pub use config::{ConduitConfig, ConfigError, ConfigLoader, ProviderSettings};
pub use coordination::{
    CoordinationConfig, CoordinationResult, CoordinationStrategy, MultiAgentCoordinator,
};
pub use dispatch::{DispatchConfig, DispatchOutcome, FailureRecord, ProviderDispatcher};
pub use error::{OrchestrationError, Result};
pub use logging::{LoggingConfig, LoggingError, init_tracing};
pub use resilience::{
    BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitBreakerStatistics, CircuitState, CircuitStateChange, RetryConfig, RetryPolicy,
};
pub use routing::{
    Capability, HealthConfig, HealthMonitor, HealthState, HealthStatus, ProviderDescriptor,
    ProviderRanker, ProviderRegistry, ProviderSelector, SelectionContext, SelectionError,
    SelectionResult, SelectionStrategy,
};
pub use tasks::{
    StepHandler, StepResult, StepStatus, StepType, TaskDefinition, TaskExecutionResult,
    TaskOrchestrator, TaskStatus, TaskStep,
};

/// Key/value context shared by every agent in a coordinated run.
pub type SharedContext = HashMap<String, serde_json::Value>;

/// What an agent returned for one instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    /// Name of the responding agent.
    pub agent_name: String,
    /// Whether the agent produced a result.
    pub success: bool,
    /// Result text on success.
    pub result: Option<String>,
    /// Failure description otherwise.
    pub error: Option<String>,
}

impl AgentResponse {
    /// A successful response.
    pub fn succeeded(agent_name: &str, result: impl Into<String>) -> Self {
        Self { agent_name: agent_name.to_string(), success: true, result: Some(result.into()), error: None }
    }

    /// A failed response.
    pub fn failed(agent_name: &str, error: impl Into<String>) -> Self {
        Self { agent_name: agent_name.to_string(), success: false, result: None, error: Some(error.into()) }
    }

    /// Result text, empty when there is none.
    pub fn text(&self) -> &str {
        self.result.as_deref().unwrap_or_default()
    }
}

/// A collaborator that carries out instructions.
///
/// Agents report failure inside [`AgentResponse`] rather than as an error, so a
/// coordinator can always account for every agent it called.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Returns the agent's name, unique within a coordinator.
    fn name(&self) -> &str;

    /// Returns a description of the agent's role.
    fn description(&self) -> &str {
        ""
    }

    /// Executes one instruction.
    ///
    /// # Arguments
    /// * `instruction` - The text to act on
    /// * `context` - Optional shared key/value context
    /// * `cancellation` - The caller's cancellation signal
    async fn execute(
        &self,
        instruction: &str,
        context: Option<&SharedContext>,
        cancellation: &CancellationToken,
    ) -> AgentResponse;
}
