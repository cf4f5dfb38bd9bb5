//! Provider abstraction layer for Conduit.
//!
//! This module defines the contract between the dispatch core and the backends that
//! actually fulfil language-model requests. The core only ever observes success or
//! failure (and how long a call took); everything about the wire is the provider's business.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Represents an error that can occur when invoking a provider.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderError {
    /// Transport-level failure (connection reset, DNS, TLS, 5xx gateway errors).
    #[error("Request Error: {0}")]
    RequestError(String),

    /// The call did not complete within the provider's deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The request itself was rejected as invalid (bad parameters, unsupported input).
    #[error("Invalid Request: {0}")]
    InvalidRequest(String),

    /// The provider returned an error for a well-formed request.
    #[error("Provider Response Error: {0}")]
    ResponseError(String),

    /// Provider quota exceeded or rate limit hit (hard stop for this provider).
    #[error("Provider '{provider}' quota exceeded{}", message.as_ref().map(|m| format!(": {}", m)).unwrap_or_default())]
    QuotaExceeded {
        /// The provider name (e.g., "openai", "gemini").
        provider: String,
        /// Optional error message from the provider.
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// The caller cancelled the call before it completed.
    #[error("Request cancelled")]
    Cancelled,

    /// Other unexpected errors.
    #[error("Other Provider Error: {0}")]
    Other(String),
}

impl ProviderError {
    /// Whether a retry of the same call may succeed.
    ///
    /// Only timeouts and transport failures qualify; validation and logic errors never do.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::RequestError(_) | Self::Timeout(_))
    }
}

/// Represents a message in a conversation with a chat provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message sender (e.g., "user", "assistant", "system").
    pub role: String,
    /// The content of the message.
    pub content: String,
}

impl ChatMessage {
    /// Creates a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    /// Creates a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    /// Creates an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

/// Parameters for controlling generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderParameters {
    /// What sampling temperature to use, between 0 and 2.
    pub temperature: Option<f32>,

    /// The maximum number of tokens to generate.
    pub max_tokens: Option<u32>,

    /// Sequences where the provider will stop generating further tokens.
    pub stop_sequences: Option<Vec<String>>,
}

impl Default for ProviderParameters {
    fn default() -> Self {
        Self { temperature: Some(0.7), max_tokens: Some(1024), stop_sequences: None }
    }
}

/// A request handed to a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// Conversation to complete, oldest message first.
    pub messages: Vec<ChatMessage>,

    /// Optional generation parameters; providers apply their own defaults when absent.
    pub parameters: Option<ProviderParameters>,
}

impl ProviderRequest {
    /// Creates a single-turn request from a prompt.
    #[must_use]
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self { messages: vec![ChatMessage::user(prompt)], parameters: None }
    }

    /// Prepends a system prompt.
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.messages.insert(0, ChatMessage::system(system));
        self
    }

    /// Sets generation parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: ProviderParameters) -> Self {
        self.parameters = Some(parameters);
        self
    }

    /// Returns the content of the last user message, if any.
    pub fn prompt(&self) -> Option<&str> {
        self.messages.iter().rev().find(|m| m.role == "user").map(|m| m.content.as_str())
    }
}

/// The response from a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The generated content.
    pub content: String,

    /// Optional: The ID of the model that produced the response.
    pub model_id: Option<String>,

    /// Optional: Usage statistics for the request.
    pub usage: Option<ProviderUsage>,
}

impl ProviderResponse {
    /// Creates a response carrying only text.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: content.into(), model_id: None, usage: None }
    }
}

/// Usage statistics for a provider request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderUsage {
    /// Number of units in the prompt.
    pub prompt_tokens: u32,

    /// Number of units in the completion.
    pub completion_tokens: u32,

    /// Total number of units used.
    pub total_tokens: u32,
}

/// A backend capable of fulfilling a language-model request.
///
/// All providers must be `Send + Sync` so a single handle can serve concurrent callers.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Returns the provider's registry name.
    fn name(&self) -> &str;

    /// Invokes the provider.
    ///
    /// Implementations should observe `cancellation` and return
    /// [`ProviderError::Cancelled`] when it trips; the core never aborts an in-flight call.
    ///
    /// # Errors
    /// Returns a `ProviderError` if the call fails.
    async fn invoke(
        &self,
        request: &ProviderRequest,
        cancellation: &CancellationToken,
    ) -> Result<ProviderResponse, ProviderError>;
}
