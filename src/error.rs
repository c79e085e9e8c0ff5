//! Error taxonomy for the scheduling engine.

use crate::task::types::TaskId;

/// Errors returned by the queue, task manager and workflow coordinator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// A task with the same id is already queued.
    #[error("Task {0} is already queued")]
    DuplicateTask(TaskId),

    #[error("Cannot decompose task {task_id}: {reason}")]
    Decomposition { task_id: TaskId, reason: String },

    /// No executor is registered for the task or step type.
    #[error("No executor registered for type '{0}'")]
    NoExecutor(String),

    #[error("Workflow capacity reached ({active}/{limit} active)")]
    Capacity { active: usize, limit: usize },

    #[error("Invalid workflow: {0}")]
    Validation(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    /// Only ever causes a requeue, unless the dependency can no longer be met.
    #[error("Task {task_id} is waiting on dependency {dependency}")]
    DependencyUnmet { task_id: TaskId, dependency: TaskId },

    #[error("Task {0} not found")]
    TaskNotFound(TaskId),

    #[error("Workflow {0} not found")]
    WorkflowNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Short machine-readable tag, used in persisted error records.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::DuplicateTask(_) => "duplicate_task",
            EngineError::Decomposition { .. } => "decomposition",
            EngineError::NoExecutor(_) => "no_executor",
            EngineError::Capacity { .. } => "capacity",
            EngineError::Validation(_) => "validation",
            EngineError::Execution(_) => "execution",
            EngineError::DependencyUnmet { .. } => "dependency_unmet",
            EngineError::TaskNotFound(_) => "task_not_found",
            EngineError::WorkflowNotFound(_) => "workflow_not_found",
            EngineError::Storage(_) => "storage",
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        EngineError::Storage(error.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(error: std::io::Error) -> Self {
        EngineError::Storage(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
