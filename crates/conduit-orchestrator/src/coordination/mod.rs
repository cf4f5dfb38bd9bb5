//! Multi-agent coordination.
//!
//! A [`MultiAgentCoordinator`] runs one task across its registered agents using one of
//! four strategies:
//!
//! - **Sequential**: each agent's output is the next agent's input; stops on the first failure.
//! - **Parallel**: every agent answers the same input concurrently; all must succeed before
//!   a synthesis call merges the answers.
//! - **Debate**: rounds of concurrent opinions, each round seeing the previous one, until the
//!   answers agree (word-set Jaccard similarity) or the round limit is hit.
//! - **Hierarchical**: the first agent splits the task, the rest work the subtasks
//!   concurrently, and the first agent combines their results.

pub mod coordinator;
pub mod similarity;
pub mod subtasks;

pub use coordinator::MultiAgentCoordinator;
pub use similarity::{all_pairs_similar, jaccard_similarity};
pub use subtasks::{assign_subtasks, parse_subtasks};

use crate::AgentResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// `[coordination]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Upper bound on debate rounds.
    pub max_debate_rounds: u32,
    /// Pairwise similarity every debate answer must reach (inclusive) for early consensus.
    pub similarity_threshold: f64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self { max_debate_rounds: 3, similarity_threshold: 0.7 }
    }
}

/// How agents cooperate on a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationStrategy {
    /// Pipe outputs through agents in order.
    Sequential,
    /// Same input to every agent, then synthesize.
    Parallel,
    /// Rounds of opinions until consensus.
    Debate,
    /// Coordinator decomposes, workers execute, coordinator synthesizes.
    Hierarchical,
}

impl fmt::Display for CoordinationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Debate => "debate",
            Self::Hierarchical => "hierarchical",
        };
        write!(f, "{name}")
    }
}

/// Outcome of one coordinated run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationResult {
    /// The task text.
    pub task: String,
    /// Strategy used.
    pub strategy: CoordinationStrategy,
    /// Individual agent responses in call order (registration order within a fan-out).
    /// Synthesis calls are not included.
    pub responses: Vec<AgentResponse>,
    /// The answer handed back to the caller.
    pub final_answer: Option<String>,
    /// Whether the run produced a final answer without failures.
    pub success: bool,
    /// Failure description.
    pub error: Option<String>,
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// Run end.
    pub completed_at: DateTime<Utc>,
    /// Elapsed wall time.
    pub duration: Duration,
    /// Debate rounds run; zero for other strategies.
    pub rounds_completed: u32,
    /// Whether a debate stopped early on agreement.
    pub consensus_reached: bool,
}

impl CoordinationResult {
    /// Response of a named agent; the last one when an agent answered several times.
    pub fn response_from(&self, agent_name: &str) -> Option<&AgentResponse> {
        self.responses.iter().rev().find(|r| r.agent_name == agent_name)
    }
}
