//! Runs one task across several agents.

use super::similarity::all_pairs_similar;
use super::subtasks::{assign_subtasks, parse_subtasks};
use super::{CoordinationConfig, CoordinationResult, CoordinationStrategy};
use crate::error::OrchestrationError;
use crate::{Agent, AgentResponse, SharedContext};
use chrono::Utc;
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a strategy runner produced before timestamps are attached.
#[derive(Default)]
struct RunOutcome {
    responses: Vec<AgentResponse>,
    final_answer: Option<String>,
    error: Option<String>,
    rounds_completed: u32,
    consensus_reached: bool,
}

impl RunOutcome {
    fn failed(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

fn agent_error(response: &AgentResponse) -> OrchestrationError {
    OrchestrationError::Agent {
        agent: response.agent_name.clone(),
        message: response.error.clone().unwrap_or_else(|| "no result".to_string()),
    }
}

fn summarize_failures(responses: &[AgentResponse]) -> String {
    responses
        .iter()
        .filter(|r| !r.success)
        .map(|r| agent_error(r).to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn labelled(responses: &[AgentResponse]) -> String {
    responses
        .iter()
        .filter(|r| r.success)
        .map(|r| format!("[{}]: {}", r.agent_name, r.text()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Coordinates registered agents under one strategy.
///
/// Agents are kept in registration order; that order drives Sequential piping, the
/// Hierarchical coordinator/worker split, and the order of returned responses.
pub struct MultiAgentCoordinator {
    strategy: CoordinationStrategy,
    config: CoordinationConfig,
    agents: Vec<Arc<dyn Agent>>,
    synthesizer: Option<Arc<dyn Agent>>,
}

impl fmt::Debug for MultiAgentCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiAgentCoordinator")
            .field("strategy", &self.strategy)
            .field("config", &self.config)
            .field("agents", &self.agent_names())
            .field("synthesizer", &self.synthesizer.as_ref().map(|a| a.name().to_string()))
            .finish()
    }
}

impl MultiAgentCoordinator {
    /// Creates a coordinator with no agents.
    pub fn new(strategy: CoordinationStrategy, config: CoordinationConfig) -> Self {
        Self { strategy, config, agents: Vec::new(), synthesizer: None }
    }

    /// Appends an agent.
    pub fn register_agent(&mut self, agent: Arc<dyn Agent>) {
        debug!(agent = %agent.name(), position = self.agents.len(), "Registering agent");
        self.agents.push(agent);
    }

    /// Uses a dedicated agent for Parallel and Debate synthesis instead of the first
    /// registered agent.
    #[must_use]
    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn Agent>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    /// The active strategy.
    pub fn strategy(&self) -> CoordinationStrategy {
        self.strategy
    }

    /// Switches strategy for subsequent runs.
    pub fn set_strategy(&mut self, strategy: CoordinationStrategy) {
        self.strategy = strategy;
    }

    /// Registered agent names in order.
    pub fn agent_names(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.name().to_string()).collect()
    }

    /// Runs the task under the active strategy.
    ///
    /// # Arguments
    /// * `task` - The task text
    /// * `context` - Optional shared context passed to every agent call
    /// * `cancellation` - Checked before each agent call or round
    ///
    /// # Returns
    /// A result describing every agent response; failures are reported in it, never raised.
    pub async fn execute(
        &self,
        task: &str,
        context: Option<&SharedContext>,
        cancellation: &CancellationToken,
    ) -> CoordinationResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(strategy = %self.strategy, agents = self.agents.len(), "Coordination started");

        let outcome = if self.agents.is_empty() {
            RunOutcome::default().failed("no agents registered")
        } else if cancellation.is_cancelled() {
            RunOutcome::default().failed(OrchestrationError::Cancelled)
        } else {
            match self.strategy {
                CoordinationStrategy::Sequential => self.run_sequential(task, context, cancellation).await,
                CoordinationStrategy::Parallel => self.run_parallel(task, context, cancellation).await,
                CoordinationStrategy::Debate => self.run_debate(task, context, cancellation).await,
                CoordinationStrategy::Hierarchical => {
                    self.run_hierarchical(task, context, cancellation).await
                }
            }
        };

        let success = outcome.error.is_none() && outcome.final_answer.is_some();
        if success {
            info!(strategy = %self.strategy, responses = outcome.responses.len(), "Coordination completed");
        } else {
            warn!(strategy = %self.strategy, error = ?outcome.error, "Coordination failed");
        }

        CoordinationResult {
            task: task.to_string(),
            strategy: self.strategy,
            responses: outcome.responses,
            final_answer: outcome.final_answer,
            success,
            error: outcome.error,
            started_at,
            completed_at: Utc::now(),
            duration: clock.elapsed(),
            rounds_completed: outcome.rounds_completed,
            consensus_reached: outcome.consensus_reached,
        }
    }

    async fn run_sequential(
        &self,
        task: &str,
        context: Option<&SharedContext>,
        cancellation: &CancellationToken,
    ) -> RunOutcome {
        let mut outcome = RunOutcome::default();
        let mut input = task.to_string();

        for agent in &self.agents {
            if cancellation.is_cancelled() {
                return outcome.failed(OrchestrationError::Cancelled);
            }
            let response = agent.execute(&input, context, cancellation).await;
            debug!(agent = %response.agent_name, success = response.success, "Sequential step finished");
            if !response.success {
                let error = agent_error(&response);
                outcome.responses.push(response);
                return outcome.failed(error);
            }
            input = response.text().to_string();
            outcome.responses.push(response);
        }

        outcome.final_answer = Some(input);
        outcome
    }

    async fn run_parallel(
        &self,
        task: &str,
        context: Option<&SharedContext>,
        cancellation: &CancellationToken,
    ) -> RunOutcome {
        let mut outcome = RunOutcome::default();
        outcome.responses =
            join_all(self.agents.iter().map(|agent| agent.execute(task, context, cancellation))).await;

        if outcome.responses.iter().any(|r| !r.success) {
            let failures = summarize_failures(&outcome.responses);
            return outcome.failed(failures);
        }

        let prompt = format!(
            "Synthesize these responses into a single answer.\n\nTask: {task}\n\nResponses:\n{}",
            labelled(&outcome.responses)
        );
        self.synthesize(outcome, &prompt, context, cancellation).await
    }

    async fn run_debate(
        &self,
        task: &str,
        context: Option<&SharedContext>,
        cancellation: &CancellationToken,
    ) -> RunOutcome {
        let mut outcome = RunOutcome::default();
        let mut transcript = String::new();
        let mut previous: Vec<AgentResponse> = Vec::new();

        for round in 1..=self.config.max_debate_rounds {
            if cancellation.is_cancelled() {
                return outcome.failed(OrchestrationError::Cancelled);
            }

            let instruction = if previous.is_empty() {
                task.to_string()
            } else {
                format!(
                    "{task}\n\nOpinions from the previous round:\n{}\n\nConsider these opinions and give your updated answer.",
                    labelled(&previous)
                )
            };

            let responses =
                join_all(self.agents.iter().map(|agent| agent.execute(&instruction, context, cancellation)))
                    .await;
            outcome.rounds_completed = round;

            if responses.iter().all(|r| !r.success) {
                let failures = summarize_failures(&responses);
                outcome.responses.extend(responses);
                return outcome.failed(failures);
            }

            transcript.push_str(&format!("Round {round}:\n{}\n\n", labelled(&responses)));
            let texts: Vec<&str> = responses.iter().filter(|r| r.success).map(AgentResponse::text).collect();
            let consensus = all_pairs_similar(&texts, self.config.similarity_threshold);
            debug!(round, successes = texts.len(), consensus, "Debate round finished");

            outcome.responses.extend(responses.iter().cloned());
            previous = responses.into_iter().filter(|r| r.success).collect();
            if consensus {
                outcome.consensus_reached = true;
                info!(round, "Debate reached consensus");
                break;
            }
        }

        let prompt = format!(
            "Synthesize a final answer from this debate.\n\nTask: {task}\n\n{}",
            transcript.trim_end()
        );
        self.synthesize(outcome, &prompt, context, cancellation).await
    }

    async fn run_hierarchical(
        &self,
        task: &str,
        context: Option<&SharedContext>,
        cancellation: &CancellationToken,
    ) -> RunOutcome {
        let mut outcome = RunOutcome::default();
        let Some((coordinator, workers)) = self.agents.split_first() else {
            return outcome.failed("no agents registered");
        };
        if workers.is_empty() {
            return outcome.failed("hierarchical coordination needs at least one worker agent");
        }

        let decomposition = coordinator
            .execute(
                &format!(
                    "Break this task into {} subtasks, one per line, each starting with '-' or a number.\n\nTask: {task}",
                    workers.len()
                ),
                context,
                cancellation,
            )
            .await;
        if !decomposition.success {
            let error = agent_error(&decomposition);
            outcome.responses.push(decomposition);
            return outcome.failed(error);
        }

        let assignments = assign_subtasks(&parse_subtasks(decomposition.text()), workers.len());
        outcome.responses.push(decomposition);
        if assignments.is_empty() {
            return outcome.failed("coordinator produced no subtasks");
        }
        if cancellation.is_cancelled() {
            return outcome.failed(OrchestrationError::Cancelled);
        }

        debug!(subtasks = assignments.len(), workers = workers.len(), "Dispatching subtasks");
        let instructions: Vec<String> = assignments
            .iter()
            .map(|subtask| format!("Overall task: {task}\n\nYour subtask:\n{subtask}"))
            .collect();
        let results = join_all(
            workers
                .iter()
                .zip(&instructions)
                .map(|(worker, instruction)| worker.execute(instruction, context, cancellation)),
        )
        .await;

        let failures = summarize_failures(&results);
        let prompt = format!(
            "Combine the workers' results into a final answer.\n\nTask: {task}\n\nResults:\n{}",
            labelled(&results)
        );
        outcome.responses.extend(results);
        if !failures.is_empty() {
            return outcome.failed(failures);
        }

        let synthesis = coordinator.execute(&prompt, context, cancellation).await;
        Self::finish_synthesis(outcome, synthesis)
    }

    async fn synthesize(
        &self,
        outcome: RunOutcome,
        prompt: &str,
        context: Option<&SharedContext>,
        cancellation: &CancellationToken,
    ) -> RunOutcome {
        if cancellation.is_cancelled() {
            return outcome.failed(OrchestrationError::Cancelled);
        }
        let Some(synthesizer) = self.synthesizer.as_ref().or_else(|| self.agents.first()) else {
            return outcome.failed("no agent available for synthesis");
        };
        let synthesis = synthesizer.execute(prompt, context, cancellation).await;
        Self::finish_synthesis(outcome, synthesis)
    }

    fn finish_synthesis(mut outcome: RunOutcome, synthesis: AgentResponse) -> RunOutcome {
        if synthesis.success {
            outcome.final_answer = Some(synthesis.text().to_string());
            outcome
        } else {
            let error = format!("Synthesis failed: {}", agent_error(&synthesis));
            outcome.failed(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replies with a fixed text and records every instruction it receives.
    struct Scripted {
        name: String,
        reply: Option<String>,
        seen: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn ok(name: &str, reply: &str) -> Arc<Self> {
            Arc::new(Self { name: name.to_string(), reply: Some(reply.to_string()), seen: Mutex::new(Vec::new()) })
        }

        fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self { name: name.to_string(), reply: None, seen: Mutex::new(Vec::new()) })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Agent for Scripted {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(
            &self,
            instruction: &str,
            _context: Option<&SharedContext>,
            _cancellation: &CancellationToken,
        ) -> AgentResponse {
            self.seen.lock().unwrap().push(instruction.to_string());
            match &self.reply {
                Some(reply) => AgentResponse::succeeded(&self.name, reply.clone()),
                None => AgentResponse::failed(&self.name, "boom"),
            }
        }
    }

    fn coordinator(strategy: CoordinationStrategy, agents: &[Arc<Scripted>]) -> MultiAgentCoordinator {
        let mut coordinator = MultiAgentCoordinator::new(strategy, CoordinationConfig::default());
        for agent in agents {
            coordinator.register_agent(agent.clone());
        }
        coordinator
    }

    #[tokio::test]
    async fn test_no_agents() {
        let coordinator = MultiAgentCoordinator::new(CoordinationStrategy::Parallel, CoordinationConfig::default());
        let result = coordinator.execute("task", None, &CancellationToken::new()).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("no agents registered"));
    }

    #[tokio::test]
    async fn test_sequential_pipes_outputs() {
        let first = Scripted::ok("first", "outline");
        let second = Scripted::ok("second", "essay");
        let coordinator = coordinator(CoordinationStrategy::Sequential, &[first.clone(), second.clone()]);

        let result = coordinator.execute("write", None, &CancellationToken::new()).await;
        assert!(result.success);
        assert_eq!(result.final_answer.as_deref(), Some("essay"));
        assert_eq!(second.seen.lock().unwrap()[0], "outline");
    }

    #[tokio::test]
    async fn test_parallel_failure_skips_synthesis() {
        let a = Scripted::ok("a", "one");
        let b = Scripted::failing("b");
        let coordinator = coordinator(CoordinationStrategy::Parallel, &[a.clone(), b]);

        let result = coordinator.execute("task", None, &CancellationToken::new()).await;
        assert!(!result.success);
        assert_eq!(result.responses.len(), 2);
        assert!(result.error.unwrap().contains("Agent 'b' failed: boom"));
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn test_debate_without_consensus_runs_all_rounds() {
        let a = Scripted::ok("a", "cats are best");
        let b = Scripted::ok("b", "dogs rule everything");
        let coordinator = coordinator(CoordinationStrategy::Debate, &[a.clone(), b]);

        let result = coordinator.execute("pets?", None, &CancellationToken::new()).await;
        assert!(result.success);
        assert!(!result.consensus_reached);
        assert_eq!(result.rounds_completed, 3);
        assert_eq!(result.responses.len(), 6);
        // three rounds plus synthesis
        assert_eq!(a.calls(), 4);
        assert!(a.seen.lock().unwrap()[1].contains("[b]: dogs rule everything"));
    }

    #[tokio::test]
    async fn test_hierarchical_requires_worker() {
        let lead = Scripted::ok("lead", "- a");
        let coordinator = coordinator(CoordinationStrategy::Hierarchical, &[lead]);
        let result = coordinator.execute("task", None, &CancellationToken::new()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("worker"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let a = Scripted::ok("a", "x");
        let coordinator = coordinator(CoordinationStrategy::Sequential, &[a.clone()]);
        let token = CancellationToken::new();
        token.cancel();

        let result = coordinator.execute("task", None, &token).await;
        assert!(!result.success);
        assert_eq!(a.calls(), 0);
        assert_eq!(result.error.as_deref(), Some("Operation cancelled"));
    }
}
