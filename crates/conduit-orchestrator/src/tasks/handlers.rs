//! Step handlers, one per step kind.

use super::definition::{TaskDefinition, TaskStep};
use crate::dispatch::ProviderDispatcher;
use crate::error::{OrchestrationError, Result};
use crate::routing::{SelectionContext, SelectionStrategy};
use async_trait::async_trait;
use conduit_abstraction::{ProviderParameters, ProviderRequest};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([^{}]+)\}\}").expect("placeholder regex should be valid"));

/// Everything a handler may read while running one step.
#[derive(Debug)]
pub struct StepContext<'a> {
    /// The task being run.
    pub task: &'a TaskDefinition,
    /// The step to run.
    pub step: &'a TaskStep,
    /// Outputs of completed steps keyed by step id.
    pub outputs: &'a HashMap<String, String>,
    /// The task's cancellation signal.
    pub cancellation: &'a CancellationToken,
}

impl StepContext<'_> {
    /// Output of a completed step.
    pub fn output_of(&self, step_id: &str) -> Option<&str> {
        self.outputs.get(step_id).map(String::as_str)
    }
}

/// What a handler produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    /// Result payload.
    pub output: String,
    /// Provider that served the step, if any.
    pub provider: Option<String>,
}

impl StepOutput {
    /// Output with no provider attribution.
    pub fn text(output: impl Into<String>) -> Self {
        Self { output: output.into(), provider: None }
    }
}

/// Runs steps of one kind.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Executes the step.
    ///
    /// # Errors
    /// Any error fails the step and, with it, the task.
    async fn execute(&self, context: &StepContext<'_>) -> Result<StepOutput>;
}

/// Substitutes `{{step_id}}` placeholders for each declared dependency.
///
/// Substitution is a single pass over the template; placeholders that appear inside a
/// substituted output are left as written.
pub fn render_prompt(template: &str, step: &TaskStep, outputs: &HashMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(template, |captures: &Captures<'_>| {
            let name = &captures[1];
            if step.depends_on.iter().any(|d| d == name) {
                outputs.get(name).cloned().unwrap_or_default()
            } else {
                captures[0].to_string()
            }
        })
        .into_owned()
}

/// Prompts a provider through the dispatcher.
///
/// Parameters:
/// * `prompt` - template with `{{step_id}}` placeholders (required)
/// * `system_prompt` - optional system message
/// * `provider` - forces the Specific strategy on that provider
/// * `strategy` - overrides the handler's strategy
/// * `temperature`, `max_tokens` - generation parameters
#[derive(Debug)]
pub struct LlmQueryHandler {
    dispatcher: Arc<ProviderDispatcher>,
    strategy: SelectionStrategy,
    context: SelectionContext,
}

impl LlmQueryHandler {
    /// Creates a handler using the dispatcher's default strategy.
    pub fn new(dispatcher: Arc<ProviderDispatcher>) -> Self {
        let strategy = dispatcher.config().default_strategy;
        Self { dispatcher, strategy, context: SelectionContext::new() }
    }

    /// Sets the base selection constraints applied to every step.
    #[must_use]
    pub fn with_context(mut self, context: SelectionContext) -> Self {
        self.context = context;
        self
    }

    fn request(&self, step: &TaskStep, prompt: String) -> ProviderRequest {
        let mut request = ProviderRequest::from_prompt(prompt);
        if let Some(system) = step.parameter_str("system_prompt") {
            request = request.with_system(system);
        }

        let temperature = step.parameters.get("temperature").and_then(serde_json::Value::as_f64);
        let max_tokens = step.parameters.get("max_tokens").and_then(serde_json::Value::as_u64);
        if temperature.is_some() || max_tokens.is_some() {
            let defaults = ProviderParameters::default();
            request = request.with_parameters(ProviderParameters {
                temperature: temperature.map(|t| t as f32).or(defaults.temperature),
                max_tokens: max_tokens.map(|m| m as u32).or(defaults.max_tokens),
                stop_sequences: None,
            });
        }
        request
    }
}

#[async_trait]
impl StepHandler for LlmQueryHandler {
    async fn execute(&self, context: &StepContext<'_>) -> Result<StepOutput> {
        let step = context.step;
        let template = step.parameter_str("prompt").ok_or_else(|| OrchestrationError::StepFailed {
            step_id: step.id.clone(),
            reason: "missing 'prompt' parameter".to_string(),
        })?;
        let prompt = render_prompt(template, step, context.outputs);

        let mut selection = self.context.clone();
        let strategy = if let Some(provider) = step.parameter_str("provider") {
            selection.specific_provider = Some(provider.to_string());
            SelectionStrategy::Specific
        } else {
            step.parameter_str("strategy").and_then(|s| s.parse().ok()).unwrap_or(self.strategy)
        };

        debug!(step_id = %step.id, strategy = %strategy, "Dispatching LLM query step");
        let outcome = self
            .dispatcher
            .dispatch(strategy, &selection, &self.request(step, prompt), context.cancellation)
            .await?;

        Ok(StepOutput { output: outcome.response.content, provider: Some(outcome.provider) })
    }
}

/// Checks that a prior step produced a non-empty result.
///
/// The checked step is the `target_step` parameter, or the first dependency.
/// On success the checked output is passed through.
#[derive(Debug, Default)]
pub struct ValidationHandler;

#[async_trait]
impl StepHandler for ValidationHandler {
    async fn execute(&self, context: &StepContext<'_>) -> Result<StepOutput> {
        let step = context.step;
        let target = step
            .parameter_str("target_step")
            .or_else(|| step.depends_on.first().map(String::as_str))
            .ok_or_else(|| OrchestrationError::StepFailed {
                step_id: step.id.clone(),
                reason: "no 'target_step' parameter and no dependency to validate".to_string(),
            })?;

        match context.output_of(target) {
            Some(output) if !output.trim().is_empty() => Ok(StepOutput::text(output)),
            Some(_) => {
                Err(OrchestrationError::Validation(format!("step '{target}' produced an empty result")))
            }
            None => Err(OrchestrationError::Validation(format!("step '{target}' has no result"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::definition::StepType;

    fn outputs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    #[test]
    fn test_render_prompt_substitutes_dependencies() {
        let step = TaskStep::llm_query("summary", "Summarize {{draft}} and {{notes}}")
            .depends_on("draft")
            .depends_on("notes");
        let rendered =
            render_prompt("Summarize {{draft}} and {{notes}}", &step, &outputs(&[("draft", "D"), ("notes", "N")]));
        assert_eq!(rendered, "Summarize D and N");
    }

    #[test]
    fn test_render_prompt_ignores_undeclared_placeholders() {
        let step = TaskStep::llm_query("s", "{{a}} {{b}}").depends_on("a");
        let rendered = render_prompt("{{a}} {{b}}", &step, &outputs(&[("a", "x"), ("b", "y")]));
        assert_eq!(rendered, "x {{b}}");
    }

    #[test]
    fn test_render_prompt_does_not_expand_inserted_text() {
        let step = TaskStep::llm_query("reply", "{{quote}} / {{other}}")
            .depends_on("quote")
            .depends_on("other");
        let outputs = outputs(&[("quote", "she wrote {{other}}"), ("other", "O")]);
        let rendered = render_prompt("{{quote}} / {{other}}", &step, &outputs);
        assert_eq!(rendered, "she wrote {{other}} / O");
    }

    #[tokio::test]
    async fn test_validation_passes_non_empty() {
        let task = TaskDefinition::new("t", vec![]);
        let step = TaskStep::validation("check", "draft");
        let outputs = outputs(&[("draft", "content")]);
        let token = CancellationToken::new();
        let context = StepContext { task: &task, step: &step, outputs: &outputs, cancellation: &token };

        let output = ValidationHandler.execute(&context).await.unwrap();
        assert_eq!(output.output, "content");
    }

    #[tokio::test]
    async fn test_validation_rejects_blank() {
        let task = TaskDefinition::new("t", vec![]);
        let step = TaskStep::validation("check", "draft");
        let outputs = outputs(&[("draft", "   ")]);
        let token = CancellationToken::new();
        let context = StepContext { task: &task, step: &step, outputs: &outputs, cancellation: &token };

        let err = ValidationHandler.execute(&context).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Validation(_)));
    }

    #[tokio::test]
    async fn test_validation_without_target() {
        let task = TaskDefinition::new("t", vec![]);
        let step = TaskStep::new("check", StepType::Validation);
        let outputs = HashMap::new();
        let token = CancellationToken::new();
        let context = StepContext { task: &task, step: &step, outputs: &outputs, cancellation: &token };

        let err = ValidationHandler.execute(&context).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::StepFailed { .. }));
    }
}
