//! # Taskflow
//!
//! An in-process engine for running units of asynchronous work. It has two
//! cooperating halves that share one lifecycle event stream and an optional
//! persistence layer.
//!
//! ## Architecture Overview
//!
//! - **[`task`]**: Priority queue with bounded concurrency, dependencies,
//!   retries, timeouts, cancellation and decomposition into subtasks
//! - **[`workflow`]**: DAG workflows of typed steps with conditions, retry
//!   policies, pause/resume and output aggregation
//! - **[`events`]**: Broadcast lifecycle events plus registered observers
//! - **[`storage`]**: Write-behind persistence of tasks and workflows
//! - **[`cli`]**: Configuration discovery and the `taskflow` binary front-end
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use taskflow::{ExecutorRegistry, TaskManager, TaskManagerConfig, TaskOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut executors = ExecutorRegistry::new();
//!     executors.register_fn("double", |task, _ctx| async move {
//!         let n = task.input["n"].as_i64().unwrap_or_default();
//!         Ok(json!(n * 2))
//!     });
//!
//!     let manager = TaskManager::new(TaskManagerConfig::default(), executors);
//!     let task = manager
//!         .submit_task("double", json!({"n": 21}), TaskOptions::default())
//!         .await?;
//!     let done = manager.wait_for_task(&task.id).await?;
//!     println!("{:?}", done.output);
//!     Ok(())
//! }
//! ```

/// Task scheduling and execution.
///
/// Tasks are queued by priority, admitted under a concurrency ceiling and a
/// host resource threshold, and retried until their attempt budget runs out.
pub mod task;

/// DAG workflow coordination.
pub mod workflow;

/// Lifecycle events shared by tasks and workflows.
pub mod events;

/// Host CPU and memory sampling used for admission control.
pub mod resources;

/// Record persistence.
pub mod storage;

/// Error type returned by the engine API.
pub mod error;

/// Environment constants and path utilities.
pub mod env;

// CLI module for command-line interface
pub mod cli;

pub use error::{EngineError, Result};
pub use events::{EventBus, EventHandler, FnEventHandler, LifecycleEvent, LoggingEventHandler};
pub use storage::{JsonFileStore, MemoryStore, StateStore, StorageBackend, StorageConfig};
pub use task::{
    ExecutionContext, ExecutorRegistry, Task, TaskDecomposer, TaskDependency, TaskExecutor,
    TaskFilter, TaskManager, TaskManagerConfig, TaskOptions, TaskPriority, TaskStats, TaskStatus,
};
pub use workflow::{
    CoordinatorConfig, RetryPolicy, StepCondition, StepExecutor, StepRegistry, StepRequest,
    TaskStep, Workflow, WorkflowCoordinator, WorkflowStatus, WorkflowStep,
};
