use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::EngineError;

/// Unique identifier for tasks
pub type TaskId = String;

/// Core task structure with scheduling metadata and state tracking
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    /// Present iff `status` is `Failed`
    pub error: Option<TaskError>,
    pub metadata: TaskMetadata,
    pub dependencies: Vec<TaskDependency>,
    pub subtasks: Option<Vec<TaskId>>,
    pub parent_task_id: Option<TaskId>,
    pub timeout_ms: Option<u64>,
    /// Cooperative cancellation handle. Clones of a task share it.
    #[serde(skip, default)]
    pub cancel_token: CancellationToken,
}

/// Task lifecycle states
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Task priority levels. Smaller ordinal = more urgent.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub enum TaskPriority {
    Critical = 1,
    High = 2,
    Normal = 3,
    Low = 4,
    Background = 5,
}

/// Scheduling metadata for a task
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TaskMetadata {
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub resource_usage: Option<ResourceUsage>,
    /// Every failed attempt, oldest first
    #[serde(default)]
    pub error_history: Vec<TaskError>,
    /// Set on consolidation tasks: the decomposed parent they resolve
    #[serde(default)]
    pub consolidates: Option<TaskId>,
}

/// Resource usage summary recorded when a task completes
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub wall_time_ms: u64,
}

/// Task dependency relationship
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TaskDependency {
    pub task_id: TaskId,
    pub kind: DependencyKind,
    pub timeout_ms: Option<u64>,
}

/// Types of task dependencies
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    /// Must reach `Completed` before this task can start
    Hard,
    /// Satisfied once `Completed` or `Failed`; never blocks admission
    Soft,
}

/// Failure record attached to a task
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskError {
    pub task_id: TaskId,
    pub kind: String,
    pub message: String,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

/// Caller overrides for `TaskManager::submit_task`
#[derive(Clone, Debug, Default)]
pub struct TaskOptions {
    pub id: Option<TaskId>,
    pub priority: Option<TaskPriority>,
    pub max_attempts: Option<u32>,
    pub dependencies: Vec<TaskDependency>,
    pub timeout: Option<Duration>,
}

/// Selection criteria for `PriorityTaskQueue::filter`
#[derive(Clone, Debug, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub task_type: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task with a fresh id and default policy
    pub fn new(task_type: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            priority: TaskPriority::Normal,
            status: TaskStatus::Pending,
            input,
            output: None,
            error: None,
            metadata: TaskMetadata {
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                attempts: 0,
                max_attempts: 3,
                resource_usage: None,
                error_history: Vec::new(),
                consolidates: None,
            },
            dependencies: Vec::new(),
            subtasks: None,
            parent_task_id: None,
            timeout_ms: None,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.metadata.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_dependency(mut self, dependency: TaskDependency) -> Self {
        if !self.dependencies.iter().any(|d| d.task_id == dependency.task_id) {
            self.dependencies.push(dependency);
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Check if task is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn is_runnable(&self) -> bool {
        self.status == TaskStatus::Pending
    }

    pub fn is_running(&self) -> bool {
        self.status == TaskStatus::Running
    }

    /// True for a parent that was split and resolves through its consolidation task
    pub fn is_decomposed(&self) -> bool {
        self.subtasks.is_some()
    }

    pub fn attempts_remaining(&self) -> bool {
        self.metadata.attempts < self.metadata.max_attempts
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn hard_dependencies(&self) -> impl Iterator<Item = &TaskDependency> {
        self.dependencies
            .iter()
            .filter(|d| d.kind == DependencyKind::Hard)
    }

    /// Time between start and completion, if both are recorded
    pub fn completion_time(&self) -> Option<chrono::Duration> {
        match (self.metadata.started_at, self.metadata.completed_at) {
            (Some(started), Some(completed)) => Some(completed.signed_duration_since(started)),
            _ => None,
        }
    }

    /// Reset to a pending state for another attempt
    pub(crate) fn reset_for_retry(&mut self) {
        self.status = TaskStatus::Pending;
        self.error = None;
        self.metadata.started_at = None;
    }

    /// Record a failed attempt. `attempts` must already be incremented.
    pub(crate) fn record_failure(&mut self, error: &EngineError) -> TaskError {
        let record = TaskError {
            task_id: self.id.clone(),
            kind: error.kind().to_string(),
            message: error.to_string(),
            attempt: self.metadata.attempts,
            at: Utc::now(),
        };
        self.metadata.error_history.push(record.clone());
        record
    }
}

impl TaskPriority {
    pub const ALL: [TaskPriority; 5] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
        TaskPriority::Background,
    ];

    /// Get numeric ordinal (1 = most urgent)
    pub fn value(&self) -> u8 {
        *self as u8
    }

    /// Zero-based bucket index
    pub(crate) fn index(&self) -> usize {
        (*self as u8 - 1) as usize
    }
}

impl TryFrom<u8> for TaskPriority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(TaskPriority::Critical),
            2 => Ok(TaskPriority::High),
            3 => Ok(TaskPriority::Normal),
            4 => Ok(TaskPriority::Low),
            5 => Ok(TaskPriority::Background),
            other => Err(format!("priority must be between 1 and 5, got {}", other)),
        }
    }
}

impl From<TaskPriority> for u8 {
    fn from(priority: TaskPriority) -> Self {
        priority.value()
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

impl TaskDependency {
    pub fn hard(task_id: impl Into<TaskId>) -> Self {
        Self {
            task_id: task_id.into(),
            kind: DependencyKind::Hard,
            timeout_ms: None,
        }
    }

    pub fn soft(task_id: impl Into<TaskId>) -> Self {
        Self {
            task_id: task_id.into(),
            kind: DependencyKind::Soft,
            timeout_ms: None,
        }
    }

    /// Give up waiting once this much time has passed since the dependent was created
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

impl TaskOptions {
    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_dependency(mut self, dependency: TaskDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        if self.status.is_some_and(|status| task.status != status) {
            return false;
        }
        if self.priority.is_some_and(|priority| task.priority != priority) {
            return false;
        }
        if let Some(task_type) = &self.task_type
            && &task.task_type != task_type
        {
            return false;
        }
        if self
            .created_after
            .is_some_and(|after| task.metadata.created_at < after)
        {
            return false;
        }
        if self
            .created_before
            .is_some_and(|before| task.metadata.created_at > before)
        {
            return false;
        }
        true
    }
}
