use crate::task::types::*;
use anyhow::Result;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-attempt state handed to an executor alongside the task
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub task_id: TaskId,
    /// 1-based attempt number
    pub attempt: u32,
    /// Outputs of the task's completed dependencies, keyed by task id
    pub dependency_outputs: HashMap<TaskId, Value>,
    pub cancel_token: CancellationToken,
}

impl ExecutionContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Capability that turns a task into an output.
///
/// The manager may call `execute` several times for the same task id across
/// attempts, so implementations must be safe to retry.
#[async_trait::async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task, context: &ExecutionContext) -> Result<Value>;
}

/// Adapter so plain async closures can be registered as executors
pub struct FnExecutor<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> TaskExecutor for FnExecutor<F>
where
    F: Fn(Task, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn execute(&self, task: &Task, context: &ExecutionContext) -> Result<Value> {
        (self.0)(task.clone(), context.clone()).await
    }
}

/// Returns the task input unchanged
pub struct EchoExecutor;

#[async_trait::async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(&self, task: &Task, _context: &ExecutionContext) -> Result<Value> {
        Ok(task.input.clone())
    }
}

/// Sleeps for `input.ms` milliseconds unless the attempt is cancelled first
pub struct DelayExecutor;

#[async_trait::async_trait]
impl TaskExecutor for DelayExecutor {
    async fn execute(&self, task: &Task, context: &ExecutionContext) -> Result<Value> {
        let ms = task.input.get("ms").and_then(Value::as_u64).unwrap_or(0);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!({ "slept_ms": ms })),
            _ = context.cancel_token.cancelled() => anyhow::bail!("delay cancelled"),
        }
    }
}

/// Executors keyed by task type
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `echo` and `delay`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("echo", Arc::new(EchoExecutor));
        registry.register("delay", Arc::new(DelayExecutor));
        registry
    }

    pub fn register(&mut self, task_type: impl Into<String>, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(task_type.into(), executor);
    }

    /// Register an async closure for `task_type`
    pub fn register_fn<F, Fut>(&mut self, task_type: impl Into<String>, f: F)
    where
        F: Fn(Task, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(task_type, Arc::new(FnExecutor(f)));
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(task_type).cloned()
    }

    pub fn has_capability(&self, task_type: &str) -> bool {
        self.executors.contains_key(task_type)
    }

    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("types", &self.types())
            .finish()
    }
}
