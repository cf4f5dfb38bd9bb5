//! Execution records for tasks and their steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Task execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Created but not yet running.
    NotStarted,
    /// Steps are executing.
    InProgress,
    /// Every step finished.
    Completed,
    /// A step failed.
    Failed,
    /// Stopped through the cancellation signal.
    Cancelled,
    /// Halted after a step that requires approval.
    PendingApproval,
}

impl TaskStatus {
    /// Checks if the task can transition to the given state.
    ///
    /// # Arguments
    /// * `to` - The target state
    ///
    /// # Returns
    /// Returns `true` if the transition is valid, `false` otherwise.
    #[must_use]
    #[allow(clippy::match_same_arms)]
    pub fn can_transition_to(&self, to: Self) -> bool {
        match (self, to) {
            (Self::NotStarted, Self::InProgress | Self::Cancelled) => true,
            (
                Self::InProgress,
                Self::Completed | Self::Failed | Self::Cancelled | Self::PendingApproval,
            ) => true,
            // Resuming after approval re-enters the run.
            (Self::PendingApproval, Self::InProgress | Self::Cancelled) => true,
            (a, b) if *a == b => true,
            _ => false,
        }
    }

    /// Whether the task has stopped for good.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Step execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepStatus {
    /// Not reached yet.
    Pending,
    /// Running.
    InProgress,
    /// Produced a result.
    Completed,
    /// Produced an error.
    Failed,
    /// No handler for the step kind.
    Skipped,
}

/// Result of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Step id.
    pub step_id: String,
    /// Current state.
    pub status: StepStatus,
    /// Output payload on success.
    pub output: Option<String>,
    /// Error or skip reason.
    pub error: Option<String>,
    /// Provider that served the step, for provider-backed steps.
    pub provider: Option<String>,
    /// When the step started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step finished.
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepResult {
    /// A step that has not run.
    pub fn pending(step_id: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Pending,
            output: None,
            error: None,
            provider: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Wall time of the step, if it finished.
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }
}

/// Per-run record of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionResult {
    /// Task id.
    pub task_id: String,
    /// Current state.
    pub status: TaskStatus,
    /// One entry per step, in declared order.
    pub steps: Vec<StepResult>,
    /// Task-level error.
    pub error: Option<String>,
    /// When the run started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run stopped.
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskExecutionResult {
    /// Creates a NotStarted record with every step Pending.
    pub fn new(task_id: &str, step_ids: &[&str]) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: TaskStatus::NotStarted,
            steps: step_ids.iter().map(|id| StepResult::pending(id)).collect(),
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Looks up a step result.
    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Mutable step lookup.
    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut StepResult> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    /// Outputs of completed steps keyed by step id.
    pub fn outputs(&self) -> HashMap<String, String> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .filter_map(|s| s.output.clone().map(|o| (s.step_id.clone(), o)))
            .collect()
    }

    /// Output of the last completed step.
    pub fn final_output(&self) -> Option<&str> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.status == StepStatus::Completed)
            .and_then(|s| s.output.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        assert!(TaskStatus::NotStarted.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::PendingApproval));
        assert!(TaskStatus::PendingApproval.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Failed));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!TaskStatus::NotStarted.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::InProgress));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::InProgress));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::PendingApproval));
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::PendingApproval.is_terminal());
    }

    #[test]
    fn test_outputs_only_include_completed() {
        let mut result = TaskExecutionResult::new("t", &["a", "b"]);
        let a = result.step_mut("a").unwrap();
        a.status = StepStatus::Completed;
        a.output = Some("alpha".to_string());
        let b = result.step_mut("b").unwrap();
        b.status = StepStatus::Failed;
        b.output = Some("partial".to_string());

        let outputs = result.outputs();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs["a"], "alpha");
        assert_eq!(result.final_output(), Some("alpha"));
    }
}
