//! Agent backed by the provider dispatcher.
//!
//! Each call becomes one dispatched request: the system prompt, any retained history,
//! the shared context rendered as text, then the instruction.

use crate::dispatch::ProviderDispatcher;
use crate::routing::{SelectionContext, SelectionStrategy};
use crate::{Agent, AgentResponse, SharedContext};
use async_trait::async_trait;
use conduit_abstraction::{ChatMessage, ProviderParameters, ProviderRequest};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// An agent that answers through [`ProviderDispatcher`].
#[derive(Debug)]
pub struct ProviderAgent {
    name: String,
    description: String,
    system_prompt: Option<String>,
    dispatcher: Arc<ProviderDispatcher>,
    strategy: SelectionStrategy,
    selection: SelectionContext,
    parameters: Option<ProviderParameters>,
    history: RwLock<Vec<ChatMessage>>,
    /// Messages retained between calls; zero keeps each call stateless.
    max_history: usize,
}

impl ProviderAgent {
    /// Creates a stateless agent using the dispatcher's default strategy.
    ///
    /// # Arguments
    /// * `name` - The agent name reported in responses
    /// * `dispatcher` - Dispatcher that serves every call
    pub fn new(name: impl Into<String>, dispatcher: Arc<ProviderDispatcher>) -> Self {
        let strategy = dispatcher.config().default_strategy;
        Self {
            name: name.into(),
            description: String::new(),
            system_prompt: None,
            dispatcher,
            strategy,
            selection: SelectionContext::new(),
            parameters: None,
            history: RwLock::new(Vec::new()),
            max_history: 0,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the system prompt sent with every call.
    #[must_use]
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// Selects providers with `strategy` under `selection`.
    #[must_use]
    pub fn with_selection(mut self, strategy: SelectionStrategy, selection: SelectionContext) -> Self {
        self.strategy = strategy;
        self.selection = selection;
        self
    }

    /// Sets generation parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: ProviderParameters) -> Self {
        self.parameters = Some(parameters);
        self
    }

    /// Retains up to `max_history` messages of conversation between calls.
    #[must_use]
    pub fn with_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    /// Number of retained messages.
    pub async fn history_len(&self) -> usize {
        self.history.read().await.len()
    }

    /// Drops retained conversation.
    pub async fn clear_history(&self) {
        self.history.write().await.clear();
        debug!(agent = %self.name, "Agent history cleared");
    }

    async fn build_request(&self, instruction: &str, context: Option<&SharedContext>) -> ProviderRequest {
        let mut messages = Vec::new();
        if let Some(system) = &self.system_prompt {
            messages.push(ChatMessage::system(system.clone()));
        }
        if self.max_history > 0 {
            messages.extend(self.history.read().await.iter().cloned());
        }
        messages.push(ChatMessage::user(render_instruction(instruction, context)));
        ProviderRequest { messages, parameters: self.parameters.clone() }
    }

    async fn remember(&self, instruction: &str, reply: &str) {
        if self.max_history == 0 {
            return;
        }
        let mut history = self.history.write().await;
        history.push(ChatMessage::user(instruction));
        history.push(ChatMessage::assistant(reply));
        if history.len() > self.max_history {
            let excess = history.len() - self.max_history;
            history.drain(..excess);
            warn!(agent = %self.name, trimmed = excess, "Agent history trimmed");
        }
    }
}

/// Appends the shared context, sorted by key, below the instruction.
fn render_instruction(instruction: &str, context: Option<&SharedContext>) -> String {
    let Some(context) = context.filter(|c| !c.is_empty()) else {
        return instruction.to_string();
    };
    let mut keys: Vec<&String> = context.keys().collect();
    keys.sort();
    let lines: Vec<String> = keys
        .into_iter()
        .map(|key| match &context[key] {
            serde_json::Value::String(s) => format!("{key}: {s}"),
            other => format!("{key}: {other}"),
        })
        .collect();
    format!("{instruction}\n\nContext:\n{}", lines.join("\n"))
}

#[async_trait]
impl Agent for ProviderAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(
        &self,
        instruction: &str,
        context: Option<&SharedContext>,
        cancellation: &CancellationToken,
    ) -> AgentResponse {
        debug!(agent = %self.name, input_len = instruction.len(), "Agent executing");
        let request = self.build_request(instruction, context).await;

        match self.dispatcher.dispatch(self.strategy, &self.selection, &request, cancellation).await {
            Ok(outcome) => {
                debug!(
                    agent = %self.name,
                    provider = %outcome.provider,
                    response_len = outcome.response.content.len(),
                    "Agent completed"
                );
                self.remember(instruction, &outcome.response.content).await;
                AgentResponse::succeeded(&self.name, outcome.response.content)
            }
            Err(e) => {
                error!(agent = %self.name, error = %e, "Agent dispatch failed");
                AgentResponse::failed(&self.name, e.to_string())
            }
        }
    }
}
