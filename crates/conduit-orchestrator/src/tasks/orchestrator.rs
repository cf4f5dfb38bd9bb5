//! Multi-step task execution.
//!
//! Steps run in declared order. Before each step the orchestrator checks the task's
//! cancellation signal and that every dependency completed; the step is then handed to
//! the handler registered for its kind.

use super::definition::{StepType, TaskDefinition};
use super::handlers::{LlmQueryHandler, StepContext, StepHandler, StepOutput, ValidationHandler};
use super::status::{StepResult, StepStatus, TaskExecutionResult, TaskStatus};
use crate::dispatch::ProviderDispatcher;
use crate::error::{OrchestrationError, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Called after every step that reaches a final state.
pub type StepCallback<'a> = &'a (dyn Fn(&StepResult) + Send + Sync);

#[derive(Debug)]
struct TaskEntry {
    result: TaskExecutionResult,
    cancellation: CancellationToken,
}

impl TaskEntry {
    fn set_status(&mut self, to: TaskStatus) {
        let from = self.result.status;
        if !from.can_transition_to(to) {
            warn!(task_id = %self.result.task_id, ?from, ?to, "Ignoring invalid task transition");
            return;
        }
        self.result.status = to;
        if to.is_terminal() || to == TaskStatus::PendingApproval {
            self.result.completed_at = Some(Utc::now());
        }
    }
}

fn lock(entry: &Mutex<TaskEntry>) -> std::sync::MutexGuard<'_, TaskEntry> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Executes task definitions and retains their results until removed.
pub struct TaskOrchestrator {
    handlers: HashMap<StepType, Arc<dyn StepHandler>>,
    tasks: RwLock<HashMap<String, Arc<Mutex<TaskEntry>>>>,
}

impl fmt::Debug for TaskOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskOrchestrator")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("task_count", &self.tasks.read().unwrap_or_else(PoisonError::into_inner).len())
            .finish()
    }
}

impl Default for TaskOrchestrator {
    fn default() -> Self {
        Self::empty()
    }
}

impl TaskOrchestrator {
    /// Creates an orchestrator with the LLM query and validation handlers registered.
    pub fn new(dispatcher: Arc<ProviderDispatcher>) -> Self {
        let mut orchestrator = Self::empty();
        orchestrator.register_handler(StepType::LlmQuery, Arc::new(LlmQueryHandler::new(dispatcher)));
        orchestrator
    }

    /// Creates an orchestrator with only the validation handler registered.
    pub fn empty() -> Self {
        let mut handlers: HashMap<StepType, Arc<dyn StepHandler>> = HashMap::new();
        handlers.insert(StepType::Validation, Arc::new(ValidationHandler));
        Self { handlers, tasks: RwLock::new(HashMap::new()) }
    }

    /// Registers (or replaces) the handler for a step kind.
    pub fn register_handler(&mut self, step_type: StepType, handler: Arc<dyn StepHandler>) {
        debug!(step_type = %step_type, "Registering step handler");
        self.handlers.insert(step_type, handler);
    }

    /// Whether a handler exists for a step kind.
    pub fn has_handler(&self, step_type: StepType) -> bool {
        self.handlers.contains_key(&step_type)
    }

    /// Executes a task.
    ///
    /// # Arguments
    /// * `definition` - The task; never mutated
    /// * `on_step_completed` - Optional callback after each finished or skipped step
    /// * `cancellation` - Checked before every step; `cancel_task` trips a child of it
    ///
    /// # Returns
    /// The run record. Step failures, cancellation, and approval halts are reported in
    /// it rather than as errors.
    ///
    /// # Errors
    /// * `Definition` if the definition is malformed (no step runs)
    /// * `Other` if a task with the same id is already running
    pub async fn execute_task(
        &self,
        definition: &TaskDefinition,
        on_step_completed: Option<StepCallback<'_>>,
        cancellation: &CancellationToken,
    ) -> Result<TaskExecutionResult> {
        definition.validate()?;

        let step_ids: Vec<&str> = definition.steps.iter().map(|s| s.id.as_str()).collect();
        let mut fresh = TaskEntry {
            result: TaskExecutionResult::new(&definition.id, &step_ids),
            cancellation: cancellation.child_token(),
        };
        fresh.result.started_at = Some(Utc::now());
        fresh.set_status(TaskStatus::InProgress);
        let entry = Arc::new(Mutex::new(fresh));

        {
            let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = tasks.get(&definition.id) {
                let status = lock(existing).result.status;
                if status == TaskStatus::InProgress {
                    return Err(OrchestrationError::Other(format!(
                        "task '{}' is already running",
                        definition.id
                    )));
                }
            }
            tasks.insert(definition.id.clone(), Arc::clone(&entry));
        }

        info!(task_id = %definition.id, name = %definition.name, steps = definition.steps.len(), "Task started");

        self.run_steps(definition, &entry, 0, on_step_completed).await;
        Ok(lock(&entry).result.clone())
    }

    /// Continues a task halted in PendingApproval from its first Pending step.
    ///
    /// Completed results are kept; the caller's approval is implied by the call.
    ///
    /// # Errors
    /// `Other` if the task is unknown or not awaiting approval; `Definition` if the
    /// definition no longer validates.
    pub async fn resume_task(
        &self,
        definition: &TaskDefinition,
        on_step_completed: Option<StepCallback<'_>>,
        cancellation: &CancellationToken,
    ) -> Result<TaskExecutionResult> {
        definition.validate()?;
        let entry = self
            .entry(&definition.id)
            .ok_or_else(|| OrchestrationError::Other(format!("unknown task '{}'", definition.id)))?;

        let start = {
            let mut guard = lock(&entry);
            if guard.result.status != TaskStatus::PendingApproval {
                return Err(OrchestrationError::Other(format!(
                    "task '{}' is {:?}, not awaiting approval",
                    definition.id, guard.result.status
                )));
            }
            let start = definition
                .steps
                .iter()
                .position(|s| {
                    guard.result.step(&s.id).is_none_or(|r| r.status == StepStatus::Pending)
                })
                .unwrap_or(definition.steps.len());
            guard.cancellation = cancellation.child_token();
            guard.result.completed_at = None;
            guard.set_status(TaskStatus::InProgress);
            start
        };

        info!(task_id = %definition.id, from_step = start, "Task resumed after approval");
        self.run_steps(definition, &entry, start, on_step_completed).await;
        Ok(lock(&entry).result.clone())
    }

    /// Returns a snapshot of a task's record.
    pub fn get_task_status(&self, task_id: &str) -> Option<TaskExecutionResult> {
        self.entry(task_id).map(|entry| lock(&entry).result.clone())
    }

    /// Trips the task's cancellation signal. The task stops before its next step.
    ///
    /// # Returns
    /// `false` if the task is unknown or already finished.
    pub fn cancel_task(&self, task_id: &str) -> bool {
        let Some(entry) = self.entry(task_id) else {
            return false;
        };
        let mut guard = lock(&entry);
        match guard.result.status {
            TaskStatus::NotStarted | TaskStatus::InProgress => {
                guard.cancellation.cancel();
                info!(task_id = %task_id, "Task cancellation requested");
                true
            }
            TaskStatus::PendingApproval => {
                guard.set_status(TaskStatus::Cancelled);
                info!(task_id = %task_id, "Task cancelled while awaiting approval");
                true
            }
            _ => false,
        }
    }

    /// Discards a retained record. Running tasks are not removed.
    pub fn remove_task(&self, task_id: &str) -> Option<TaskExecutionResult> {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let running = tasks
            .get(task_id)
            .is_some_and(|entry| lock(entry).result.status == TaskStatus::InProgress);
        if running {
            return None;
        }
        tasks.remove(task_id).map(|entry| lock(&entry).result.clone())
    }

    /// Ids of every retained task.
    pub fn task_ids(&self) -> Vec<String> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }

    fn entry(&self, task_id: &str) -> Option<Arc<Mutex<TaskEntry>>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner).get(task_id).cloned()
    }

    async fn run_steps(
        &self,
        definition: &TaskDefinition,
        entry: &Mutex<TaskEntry>,
        start: usize,
        on_step_completed: Option<StepCallback<'_>>,
    ) {
        let task_id = definition.id.as_str();
        let cancellation = lock(entry).cancellation.clone();

        for step in definition.steps.iter().skip(start) {
            if cancellation.is_cancelled() {
                lock(entry).set_status(TaskStatus::Cancelled);
                info!(task_id = %task_id, next_step = %step.id, "Task cancelled");
                return;
            }

            let (outputs, unmet) = {
                let guard = lock(entry);
                let unmet: Vec<&str> = step
                    .depends_on
                    .iter()
                    .filter(|d| {
                        guard.result.step(d).is_none_or(|r| r.status != StepStatus::Completed)
                    })
                    .map(String::as_str)
                    .collect();
                (guard.result.outputs(), unmet)
            };

            let started_at = Utc::now();
            if !unmet.is_empty() {
                let reason = format!("dependencies not met: {}", unmet.join(", "));
                Self::finish_step(entry, &step.id, started_at, Err(reason.clone()), on_step_completed);
                let mut guard = lock(entry);
                guard.result.error = Some(format!("Step '{}' failed: {reason}", step.id));
                guard.set_status(TaskStatus::Failed);
                warn!(task_id = %task_id, step_id = %step.id, %reason, "Task failed");
                return;
            }

            let Some(handler) = self.handlers.get(&step.step_type) else {
                let skipped = lock(entry).result.step_mut(&step.id).map(|result| {
                    result.status = StepStatus::Skipped;
                    result.error = Some(format!("step type '{}' not implemented", step.step_type));
                    result.started_at = Some(started_at);
                    result.completed_at = Some(Utc::now());
                    result.clone()
                });
                if let (Some(result), Some(callback)) = (skipped, on_step_completed) {
                    callback(&result);
                }
                debug!(task_id = %task_id, step_id = %step.id, step_type = %step.step_type, "Step skipped");
                continue;
            };

            if let Some(result) = lock(entry).result.step_mut(&step.id) {
                result.status = StepStatus::InProgress;
                result.started_at = Some(started_at);
            }

            debug!(task_id = %task_id, step_id = %step.id, step_type = %step.step_type, "Running step");
            let context = StepContext {
                task: definition,
                step,
                outputs: &outputs,
                cancellation: &cancellation,
            };
            let outcome = handler.execute(&context).await;

            match outcome {
                Ok(output) => {
                    Self::finish_step(entry, &step.id, started_at, Ok(output), on_step_completed);
                    info!(task_id = %task_id, step_id = %step.id, "Step completed");
                }
                Err(e) if e.is_cancelled() => {
                    let mut guard = lock(entry);
                    if let Some(result) = guard.result.step_mut(&step.id) {
                        result.status = StepStatus::Pending;
                        result.started_at = None;
                    }
                    guard.set_status(TaskStatus::Cancelled);
                    info!(task_id = %task_id, step_id = %step.id, "Task cancelled during step");
                    return;
                }
                Err(e) => {
                    Self::finish_step(entry, &step.id, started_at, Err(e.to_string()), on_step_completed);
                    let mut guard = lock(entry);
                    guard.result.error = Some(
                        OrchestrationError::StepFailed { step_id: step.id.clone(), reason: e.to_string() }
                            .to_string(),
                    );
                    guard.set_status(TaskStatus::Failed);
                    warn!(task_id = %task_id, step_id = %step.id, error = %e, "Task failed");
                    return;
                }
            }

            if step.requires_human_approval {
                lock(entry).set_status(TaskStatus::PendingApproval);
                info!(task_id = %task_id, step_id = %step.id, "Task awaiting approval");
                return;
            }
        }

        lock(entry).set_status(TaskStatus::Completed);
        info!(task_id = %task_id, "Task completed");
    }

    fn finish_step(
        entry: &Mutex<TaskEntry>,
        step_id: &str,
        started_at: chrono::DateTime<Utc>,
        outcome: std::result::Result<StepOutput, String>,
        on_step_completed: Option<StepCallback<'_>>,
    ) {
        let finished = {
            let mut guard = lock(entry);
            let Some(result) = guard.result.step_mut(step_id) else {
                return;
            };
            result.started_at = Some(started_at);
            result.completed_at = Some(Utc::now());
            match outcome {
                Ok(output) => {
                    result.status = StepStatus::Completed;
                    result.output = Some(output.output);
                    result.provider = output.provider;
                    result.error = None;
                }
                Err(reason) => {
                    result.status = StepStatus::Failed;
                    result.error = Some(reason);
                }
            }
            result.clone()
        };
        // The callback may call back into the orchestrator, so the entry must be unlocked.
        if let Some(callback) = on_step_completed {
            callback(&finished);
        }
    }
}
