//! Task definitions and their pre-execution validation.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Parameter map carried by each step.
pub type StepParameters = serde_json::Map<String, serde_json::Value>;

/// Kind of work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Prompt a provider.
    LlmQuery,
    /// Fetch data from an external source.
    DataRetrieval,
    /// Check a prior step's result.
    Validation,
    /// Reshape a prior result.
    Transformation,
    /// Wait for a human decision.
    HumanApproval,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepType::LlmQuery => "llm_query",
            StepType::DataRetrieval => "data_retrieval",
            StepType::Validation => "validation",
            StepType::Transformation => "transformation",
            StepType::HumanApproval => "human_approval",
        };
        write!(f, "{name}")
    }
}

/// One unit of work within a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    /// Unique within the task.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Kind of work.
    pub step_type: StepType,
    /// Ids of steps whose results this step consumes.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Free-form parameters interpreted by the step handler.
    #[serde(default)]
    pub parameters: StepParameters,
    /// Halt the task in PendingApproval after this step completes.
    #[serde(default)]
    pub requires_human_approval: bool,
}

impl TaskStep {
    /// Creates a step with no dependencies or parameters.
    pub fn new(id: impl Into<String>, step_type: StepType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type,
            depends_on: Vec::new(),
            parameters: StepParameters::new(),
            requires_human_approval: false,
        }
    }

    /// Creates an LLM query step from a prompt template.
    pub fn llm_query(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::new(id, StepType::LlmQuery).with_parameter("prompt", prompt.into())
    }

    /// Creates a validation step checking `target`.
    pub fn validation(id: impl Into<String>, target: impl Into<String>) -> Self {
        let target = target.into();
        Self::new(id, StepType::Validation)
            .with_parameter("target_step", target.clone())
            .depends_on(target)
    }

    /// Adds a dependency.
    #[must_use]
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    /// Sets a parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// Marks the step as requiring approval.
    #[must_use]
    pub fn requiring_approval(mut self) -> Self {
        self.requires_human_approval = true;
        self
    }

    /// Returns a string parameter.
    pub fn parameter_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(serde_json::Value::as_str)
    }
}

/// An ordered list of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique task id; results are retained under it.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Steps in execution order.
    pub steps: Vec<TaskStep>,
}

impl TaskDefinition {
    /// Creates a task with a generated id.
    pub fn new(name: impl Into<String>, steps: Vec<TaskStep>) -> Self {
        Self { id: uuid::Uuid::new_v4().to_string(), name: name.into(), steps }
    }

    /// Replaces the id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Looks up a step.
    pub fn step(&self, id: &str) -> Option<&TaskStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Checks the definition before anything runs.
    ///
    /// # Errors
    /// * `EmptyTask` with no steps
    /// * `DuplicateStep` when two steps share an id
    /// * `MissingDependency` when a dependency id is not in the task
    /// * `CyclicDependency` when dependencies form a cycle (self-references included)
    /// * `ForwardDependency` when a step depends on a step declared after it
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.steps.is_empty() {
            return Err(DefinitionError::EmptyTask { task: self.id.clone() });
        }

        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
        for step in &self.steps {
            if nodes.insert(step.id.as_str(), graph.add_node(step.id.as_str())).is_some() {
                return Err(DefinitionError::DuplicateStep { step: step.id.clone() });
            }
        }

        for step in &self.steps {
            let to = nodes[step.id.as_str()];
            for dependency in &step.depends_on {
                let from = nodes.get(dependency.as_str()).ok_or_else(|| {
                    DefinitionError::MissingDependency {
                        step: step.id.clone(),
                        dependency: dependency.clone(),
                    }
                })?;
                graph.add_edge(*from, to, ());
            }
        }

        if let Err(cycle) = toposort(&graph, None) {
            return Err(DefinitionError::CyclicDependency {
                step: graph[cycle.node_id()].to_string(),
            });
        }

        let position: HashMap<&str, usize> =
            self.steps.iter().enumerate().map(|(i, s)| (s.id.as_str(), i)).collect();
        for (index, step) in self.steps.iter().enumerate() {
            for dependency in &step.depends_on {
                if position[dependency.as_str()] > index {
                    return Err(DefinitionError::ForwardDependency {
                        step: step.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// A malformed task definition. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    /// The task has no steps.
    #[error("task '{task}' has no steps")]
    EmptyTask { task: String },

    /// Two steps share an id.
    #[error("duplicate step id '{step}'")]
    DuplicateStep { step: String },

    /// A dependency references a step that is not in the task.
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    MissingDependency { step: String, dependency: String },

    /// Dependencies form a cycle.
    #[error("circular dependency involving step '{step}'")]
    CyclicDependency { step: String },

    /// A step depends on a step declared after it.
    #[error("step '{step}' depends on later step '{dependency}'")]
    ForwardDependency { step: String, dependency: String },
}
