//! In-memory task store
//!
//! Every mutation goes through one transition check, so the lifecycle rules
//! live in `TaskState::can_transition` and nowhere else.

use super::history::HistoryDispatcher;
use super::types::{Artifact, Message, Task, TaskDirection, TaskError, TaskMetadata, TaskState};
use crate::error::{ParleyError, Result};
use crate::types::now_millis;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Tasks known to this process
#[derive(Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<String, Task>>,
    history: Option<HistoryDispatcher>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward terminal tasks to a history dispatcher
    pub fn with_history(history: HistoryDispatcher) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            history: Some(history),
        }
    }

    /// Create an inbound task in `submitted`
    pub fn create(&self, message: Message, metadata: TaskMetadata) -> Task {
        self.create_in_context(message, metadata, None)
    }

    /// Create an inbound task, keeping the caller's conversation id
    pub fn create_in_context(
        &self,
        message: Message,
        metadata: TaskMetadata,
        context_id: Option<String>,
    ) -> Task {
        let mut task = Task::new(message, metadata, TaskDirection::Inbound);
        task.context_id = context_id;
        self.insert(task)
    }

    /// Create an outbound placeholder in `submitted`
    pub fn create_outbound(&self, message: Message, metadata: TaskMetadata) -> Task {
        self.insert(Task::new(message, metadata, TaskDirection::Outbound))
    }

    fn insert(&self, task: Task) -> Task {
        tracing::debug!(task_id = %task.id, direction = ?task.direction, "task created");
        self.tasks.write().insert(task.id.clone(), task.clone());
        task
    }

    /// `submitted -> working`, remembering where the session output stood
    pub fn start(&self, id: &str, output_offset: u64) -> Result<Task> {
        self.transition(id, TaskState::Working, |task| {
            task.output_offset = output_offset;
        })
    }

    pub fn complete(&self, id: &str, artifacts: Vec<Artifact>) -> Result<Task> {
        self.transition(id, TaskState::Completed, |task| {
            task.artifacts.extend(artifacts);
        })
    }

    pub fn fail(&self, id: &str, error: TaskError) -> Result<Task> {
        self.fail_with_artifacts(id, error, Vec::new())
    }

    /// Fail, keeping whatever output was parsed
    pub fn fail_with_artifacts(
        &self,
        id: &str,
        error: TaskError,
        artifacts: Vec<Artifact>,
    ) -> Result<Task> {
        self.transition(id, TaskState::Failed, |task| {
            task.artifacts.extend(artifacts);
            task.error = Some(error);
        })
    }

    pub fn cancel(&self, id: &str) -> Result<Task> {
        self.transition(id, TaskState::Canceled, |_| {})
    }

    /// `working -> input_required`; the question so far is kept as artifacts
    pub fn require_input(&self, id: &str, artifacts: Vec<Artifact>) -> Result<Task> {
        self.transition(id, TaskState::InputRequired, |task| {
            task.artifacts = artifacts;
        })
    }

    /// `input_required -> working`, tracking output from `output_offset` on
    pub fn resume(&self, id: &str, output_offset: u64) -> Result<Task> {
        self.transition(id, TaskState::Working, |task| {
            task.output_offset = output_offset;
        })
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.tasks.read().get(id).cloned()
    }

    /// All tasks, newest first
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.read().values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// Inbound tasks in `state`, oldest first
    pub fn inbound_in(&self, state: TaskState) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.direction == TaskDirection::Inbound && t.status == state)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    fn transition(&self, id: &str, to: TaskState, apply: impl FnOnce(&mut Task)) -> Result<Task> {
        let snapshot = {
            let mut tasks = self.tasks.write();
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| ParleyError::TaskNotFound(id.to_string()))?;
            if !task.status.can_transition(to) {
                return Err(ParleyError::InvalidTransition {
                    task_id: id.to_string(),
                    from: task.status.to_string(),
                    to: to.to_string(),
                });
            }
            apply(task);
            task.status = to;
            task.updated_at = now_millis();
            task.clone()
        };

        tracing::debug!(task_id = %id, status = %to, "task transitioned");
        if to.is_terminal() {
            if let Some(history) = &self.history {
                history.notify(&snapshot);
            }
        }
        Ok(snapshot)
    }
}
