//! Integration tests for multi-agent coordination.
//!
//! Tests cover:
//! - Sequential piping and short-circuit on failure
//! - Parallel fan-out with synthesis
//! - Debate consensus and early stop
//! - Hierarchical decomposition and worker assignment
//! - Provider-backed agents through the dispatcher

use async_trait::async_trait;
use conduit_abstraction::{Provider, ProviderError, ProviderRequest, ProviderResponse};
use conduit_orchestrator::{
    Agent, AgentResponse, ConduitConfig, CoordinationConfig, CoordinationStrategy,
    MultiAgentCoordinator, ProviderAgent, ProviderDescriptor, ProviderDispatcher,
    ProviderRegistry, SharedContext,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Mock agent with a reply function over the instruction.
struct MockAgent {
    name: String,
    reply: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
    delay: Duration,
    instructions: Mutex<Vec<String>>,
    calls: AtomicU32,
}

impl MockAgent {
    fn new(name: &str, reply: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            reply: Box::new(reply),
            delay: Duration::ZERO,
            instructions: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
        })
    }

    fn fixed(name: &str, reply: &str) -> Arc<Self> {
        let reply = reply.to_string();
        Self::new(name, move |_| Some(reply.clone()))
    }

    fn slow(name: &str, reply: &str, delay: Duration) -> Arc<Self> {
        let reply = reply.to_string();
        Arc::new(Self {
            name: name.to_string(),
            reply: Box::new(move |_| Some(reply.clone())),
            delay,
            instructions: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn instruction(&self, index: usize) -> String {
        self.instructions.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl Agent for MockAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        instruction: &str,
        _context: Option<&SharedContext>,
        _cancellation: &CancellationToken,
    ) -> AgentResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.instructions.lock().unwrap().push(instruction.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match (self.reply)(instruction) {
            Some(text) => AgentResponse::succeeded(&self.name, text),
            None => AgentResponse::failed(&self.name, "could not answer"),
        }
    }
}

fn coordinator(strategy: CoordinationStrategy, agents: &[&Arc<MockAgent>]) -> MultiAgentCoordinator {
    let mut coordinator = MultiAgentCoordinator::new(strategy, CoordinationConfig::default());
    for agent in agents {
        let agent: Arc<dyn Agent> = Arc::clone(*agent) as Arc<dyn Agent>;
        coordinator.register_agent(agent);
    }
    coordinator
}

#[tokio::test]
async fn test_sequential_short_circuit() {
    let x = MockAgent::fixed("x", "outline");
    let y = MockAgent::new("y", |_| None);
    let z = MockAgent::fixed("z", "final");
    let coordinator = coordinator(CoordinationStrategy::Sequential, &[&x, &y, &z]);

    let result = coordinator.execute("write an essay", None, &CancellationToken::new()).await;

    assert!(!result.success);
    assert_eq!(z.calls(), 0);
    assert_eq!(result.responses.len(), 2);
    assert!(result.responses[0].success);
    assert!(!result.responses[1].success);
    assert!(result.response_from("z").is_none());
    assert!(result.error.unwrap().contains("Agent 'y' failed"));
    assert_eq!(y.instruction(0), "outline");
    assert!(result.final_answer.is_none());
}

#[tokio::test]
async fn test_parallel_preserves_registration_order() {
    let slow = MockAgent::slow("slow", "first answer", Duration::from_millis(40));
    let fast = MockAgent::fixed("fast", "second answer");
    let coordinator = coordinator(CoordinationStrategy::Parallel, &[&slow, &fast]);

    let result = coordinator.execute("question", None, &CancellationToken::new()).await;

    assert!(result.success);
    let names: Vec<&str> = result.responses.iter().map(|r| r.agent_name.as_str()).collect();
    assert_eq!(names, vec!["slow", "fast"]);
    // The first agent synthesizes by default.
    assert_eq!(slow.calls(), 2);
    let synthesis = slow.instruction(1);
    assert!(synthesis.contains("[slow]: first answer"));
    assert!(synthesis.contains("[fast]: second answer"));
    assert_eq!(result.final_answer.as_deref(), Some("first answer"));
}

#[tokio::test]
async fn test_parallel_dedicated_synthesizer() {
    let a = MockAgent::fixed("a", "one");
    let b = MockAgent::fixed("b", "two");
    let judge = MockAgent::fixed("judge", "merged");
    let coordinator = coordinator(CoordinationStrategy::Parallel, &[&a, &b])
        .with_synthesizer(judge.clone());

    let result = coordinator.execute("question", None, &CancellationToken::new()).await;
    assert!(result.success);
    assert_eq!(result.final_answer.as_deref(), Some("merged"));
    assert_eq!((a.calls(), b.calls(), judge.calls()), (1, 1, 1));
}

#[tokio::test]
async fn test_debate_consensus_stops_after_first_round() {
    let a = MockAgent::fixed("a", "Paris is the capital of France");
    let b = MockAgent::fixed("b", "paris is the capital of france.");
    let coordinator = coordinator(CoordinationStrategy::Debate, &[&a, &b]);

    let result = coordinator.execute("capital of France?", None, &CancellationToken::new()).await;

    assert!(result.success);
    assert!(result.consensus_reached);
    assert_eq!(result.rounds_completed, 1);
    assert_eq!(result.responses.len(), 2);
    assert_eq!(b.calls(), 1);
    // One opinion plus the synthesis.
    assert_eq!(a.calls(), 2);
}

#[tokio::test]
async fn test_debate_converges_in_later_round() {
    let a = MockAgent::new("a", |instruction| {
        Some(if instruction.contains("previous round") { "blue".to_string() } else { "red".to_string() })
    });
    let b = MockAgent::fixed("b", "blue");
    let coordinator = coordinator(CoordinationStrategy::Debate, &[&a, &b]);

    let result = coordinator.execute("pick a color", None, &CancellationToken::new()).await;

    assert!(result.consensus_reached);
    assert_eq!(result.rounds_completed, 2);
    let round_two = a.instruction(1);
    assert!(round_two.starts_with("pick a color"));
    assert!(round_two.contains("[a]: red"));
    assert!(round_two.contains("[b]: blue"));
}

#[tokio::test]
async fn test_hierarchical_assigns_subtasks_in_order() {
    let lead = MockAgent::new("lead", |instruction| {
        Some(if instruction.starts_with("Break") {
            "Plan:\n1. gather sources\n2. write summary\n3. add citations".to_string()
        } else {
            "combined report".to_string()
        })
    });
    let researcher = MockAgent::fixed("researcher", "sources");
    let writer = MockAgent::fixed("writer", "summary with citations");
    let coordinator = coordinator(CoordinationStrategy::Hierarchical, &[&lead, &researcher, &writer]);

    let result = coordinator.execute("report on rust", None, &CancellationToken::new()).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.final_answer.as_deref(), Some("combined report"));
    assert!(researcher.instruction(0).ends_with("gather sources"));
    // Surplus subtask goes to the last worker.
    assert!(writer.instruction(0).ends_with("write summary\nadd citations"));
    assert!(lead.instruction(1).contains("[researcher]: sources"));
    let names: Vec<&str> = result.responses.iter().map(|r| r.agent_name.as_str()).collect();
    assert_eq!(names, vec!["lead", "researcher", "writer"]);
}

#[tokio::test]
async fn test_hierarchical_unparsed_plan_goes_to_first_worker() {
    let lead = MockAgent::new("lead", |instruction| {
        Some(if instruction.starts_with("Break") { "just research it".to_string() } else { "done".to_string() })
    });
    let first = MockAgent::fixed("first", "researched");
    let idle = MockAgent::fixed("idle", "unused");
    let coordinator = coordinator(CoordinationStrategy::Hierarchical, &[&lead, &first, &idle]);

    let result = coordinator.execute("task", None, &CancellationToken::new()).await;
    assert!(result.success);
    assert!(first.instruction(0).ends_with("just research it"));
    assert_eq!(idle.calls(), 0);
}

/// Answers every prompt with a fixed line, or fails on "refuse".
struct Oracle;

#[async_trait]
impl Provider for Oracle {
    fn name(&self) -> &str {
        "oracle"
    }

    async fn invoke(
        &self,
        request: &ProviderRequest,
        _cancellation: &CancellationToken,
    ) -> Result<ProviderResponse, ProviderError> {
        let system = request.messages.first().map(|m| m.content.clone()).unwrap_or_default();
        if request.prompt().unwrap_or_default().contains("refuse") {
            return Err(ProviderError::ResponseError("refused".to_string()));
        }
        Ok(ProviderResponse::text(format!("{system}: agreed")))
    }
}

#[tokio::test]
async fn test_provider_agents_in_sequence() {
    let registry = Arc::new(ProviderRegistry::new());
    let handle: Arc<dyn Provider> = Arc::new(Oracle);
    registry.register(ProviderDescriptor::new("oracle", 1), handle);
    let dispatcher = Arc::new(ProviderDispatcher::from_config(registry, &ConduitConfig::default()));

    let mut coordinator =
        MultiAgentCoordinator::new(CoordinationStrategy::Sequential, CoordinationConfig::default());
    coordinator.register_agent(Arc::new(
        ProviderAgent::new("planner", Arc::clone(&dispatcher)).with_system_prompt("planner"),
    ));
    coordinator.register_agent(Arc::new(
        ProviderAgent::new("reviewer", Arc::clone(&dispatcher)).with_system_prompt("reviewer"),
    ));

    let ok = coordinator.execute("plan the launch", None, &CancellationToken::new()).await;
    assert!(ok.success);
    assert_eq!(ok.final_answer.as_deref(), Some("reviewer: agreed"));
    assert_eq!(coordinator.agent_names(), vec!["planner".to_string(), "reviewer".to_string()]);

    let failed = coordinator.execute("refuse this", None, &CancellationToken::new()).await;
    assert!(!failed.success);
    assert!(failed.error.unwrap().contains("refused"));
}
