//! Lifecycle notifications for tasks and workflows.
//!
//! Events are fanned out two ways: registered [`EventHandler`]s are called in
//! registration order, and every event is published on a broadcast channel
//! for async consumers. Delivery is in-process only.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, error, info, warn};

use crate::task::types::{TaskId, TaskPriority};

const CHANNEL_CAPACITY: usize = 1024;

/// Events emitted by the task manager and workflow coordinator
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    TaskSubmitted {
        task_id: TaskId,
        task_type: String,
        priority: TaskPriority,
        at: DateTime<Utc>,
    },
    TaskStarted {
        task_id: TaskId,
        attempt: u32,
        at: DateTime<Utc>,
    },
    TaskDecomposed {
        task_id: TaskId,
        subtask_ids: Vec<TaskId>,
        at: DateTime<Utc>,
    },
    TaskCompleted {
        task_id: TaskId,
        output: Value,
        at: DateTime<Utc>,
    },
    /// `will_retry` is false once the attempt budget is spent
    TaskFailed {
        task_id: TaskId,
        error: String,
        attempt: u32,
        will_retry: bool,
        at: DateTime<Utc>,
    },
    TaskCancelled {
        task_id: TaskId,
        at: DateTime<Utc>,
    },
    WorkflowStarted {
        workflow_id: String,
        at: DateTime<Utc>,
    },
    StepCompleted {
        workflow_id: String,
        step_id: String,
        output: Value,
        at: DateTime<Utc>,
    },
    StepSkipped {
        workflow_id: String,
        step_id: String,
        at: DateTime<Utc>,
    },
    StepFailed {
        workflow_id: String,
        step_id: String,
        error: String,
        attempt: u32,
        at: DateTime<Utc>,
    },
    WorkflowPaused {
        workflow_id: String,
        at: DateTime<Utc>,
    },
    WorkflowResumed {
        workflow_id: String,
        at: DateTime<Utc>,
    },
    WorkflowCompleted {
        workflow_id: String,
        output: Value,
        at: DateTime<Utc>,
    },
    WorkflowFailed {
        workflow_id: String,
        error: String,
        at: DateTime<Utc>,
    },
}

impl LifecycleEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::TaskSubmitted { .. } => "task:submitted",
            LifecycleEvent::TaskStarted { .. } => "task:started",
            LifecycleEvent::TaskDecomposed { .. } => "task:decomposed",
            LifecycleEvent::TaskCompleted { .. } => "task:completed",
            LifecycleEvent::TaskFailed { .. } => "task:failed",
            LifecycleEvent::TaskCancelled { .. } => "task:cancelled",
            LifecycleEvent::WorkflowStarted { .. } => "workflowStarted",
            LifecycleEvent::StepCompleted { .. } => "stepCompleted",
            LifecycleEvent::StepSkipped { .. } => "stepSkipped",
            LifecycleEvent::StepFailed { .. } => "stepFailed",
            LifecycleEvent::WorkflowPaused { .. } => "workflowPaused",
            LifecycleEvent::WorkflowResumed { .. } => "workflowResumed",
            LifecycleEvent::WorkflowCompleted { .. } => "workflowCompleted",
            LifecycleEvent::WorkflowFailed { .. } => "workflowFailed",
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            LifecycleEvent::TaskSubmitted { task_id, .. }
            | LifecycleEvent::TaskStarted { task_id, .. }
            | LifecycleEvent::TaskDecomposed { task_id, .. }
            | LifecycleEvent::TaskCompleted { task_id, .. }
            | LifecycleEvent::TaskFailed { task_id, .. }
            | LifecycleEvent::TaskCancelled { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    pub fn workflow_id(&self) -> Option<&str> {
        match self {
            LifecycleEvent::WorkflowStarted { workflow_id, .. }
            | LifecycleEvent::StepCompleted { workflow_id, .. }
            | LifecycleEvent::StepSkipped { workflow_id, .. }
            | LifecycleEvent::StepFailed { workflow_id, .. }
            | LifecycleEvent::WorkflowPaused { workflow_id, .. }
            | LifecycleEvent::WorkflowResumed { workflow_id, .. }
            | LifecycleEvent::WorkflowCompleted { workflow_id, .. }
            | LifecycleEvent::WorkflowFailed { workflow_id, .. } => Some(workflow_id),
            _ => None,
        }
    }
}

/// Handler for lifecycle events
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &LifecycleEvent) -> Result<()>;
}

/// Adapter for closures
pub struct FnEventHandler<F>(pub F);

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&LifecycleEvent) -> Result<()> + Send + Sync,
{
    fn handle_event(&self, event: &LifecycleEvent) -> Result<()> {
        (self.0)(event)
    }
}

/// Fan-out point shared by the manager and coordinator
pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Receive every event emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    pub async fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Deliver to handlers, then publish. Handler errors are logged and do
    /// not stop delivery to the rest.
    pub async fn emit(&self, event: LifecycleEvent) {
        for handler in self.handlers.read().await.iter() {
            if let Err(e) = handler.handle_event(&event) {
                error!("Event handler error on {}: {}", event.name(), e);
            }
        }
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Simple event handler that logs events
pub struct LoggingEventHandler;

impl EventHandler for LoggingEventHandler {
    fn handle_event(&self, event: &LifecycleEvent) -> Result<()> {
        match event {
            LifecycleEvent::TaskSubmitted {
                task_id,
                task_type,
                priority,
                ..
            } => {
                info!(
                    "Task submitted: {} ({}, priority {})",
                    task_id,
                    task_type,
                    priority.value()
                );
            }
            LifecycleEvent::TaskStarted {
                task_id, attempt, ..
            } => {
                debug!("Task started: {} (attempt {})", task_id, attempt);
            }
            LifecycleEvent::TaskDecomposed {
                task_id,
                subtask_ids,
                ..
            } => {
                info!("Task {} decomposed into {} tasks", task_id, subtask_ids.len());
            }
            LifecycleEvent::TaskCompleted { task_id, .. } => {
                info!("Task completed: {}", task_id);
            }
            LifecycleEvent::TaskFailed {
                task_id,
                error,
                attempt,
                will_retry,
                ..
            } => {
                warn!(
                    "Task failed: {} (attempt {}, retry: {}) - {}",
                    task_id, attempt, will_retry, error
                );
            }
            LifecycleEvent::TaskCancelled { task_id, .. } => {
                info!("Task cancelled: {}", task_id);
            }
            LifecycleEvent::StepFailed {
                workflow_id,
                step_id,
                error,
                attempt,
                ..
            } => {
                warn!(
                    "Step {}/{} failed (attempt {}): {}",
                    workflow_id, step_id, attempt, error
                );
            }
            LifecycleEvent::WorkflowFailed {
                workflow_id, error, ..
            } => {
                warn!("Workflow failed: {} - {}", workflow_id, error);
            }
            other => {
                info!(
                    "{}: {}",
                    other.name(),
                    other.workflow_id().unwrap_or_default()
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_handlers_and_subscribers_receive_events() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        bus.add_handler(Arc::new(FnEventHandler(move |_: &LifecycleEvent| -> Result<()> {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })))
        .await;
        bus.add_handler(Arc::new(FnEventHandler(|_: &LifecycleEvent| -> Result<()> {
            anyhow::bail!("broken handler")
        })))
        .await;
        bus.add_handler(Arc::new(LoggingEventHandler)).await;

        let mut rx = bus.subscribe();
        bus.emit(LifecycleEvent::TaskCancelled {
            task_id: "t1".into(),
            at: Utc::now(),
        })
        .await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "task:cancelled");
        assert_eq!(event.task_id(), Some("t1"));
        assert_eq!(event.workflow_id(), None);
    }
}
