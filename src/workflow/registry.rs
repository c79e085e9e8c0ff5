use crate::task::{TaskManager, TaskOptions, TaskPriority, TaskStatus};
use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything a step executor sees for one attempt
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub workflow_id: String,
    pub step_id: String,
    pub step_type: String,
    /// 1-based attempt number
    pub attempt: u32,
    /// Workflow input overlaid with workflow variables
    pub input: Map<String, Value>,
    pub config: Value,
    /// Results of this step's own dependencies
    pub previous_results: IndexMap<String, Value>,
    pub cancel_token: CancellationToken,
}

impl StepRequest {
    /// Flattened view: input and variables, plus `stepConfig` and `previousResults`
    pub fn to_value(&self) -> Value {
        let mut value = self.input.clone();
        value.insert("stepConfig".to_string(), self.config.clone());
        value.insert(
            "previousResults".to_string(),
            serde_json::to_value(&self.previous_results).unwrap_or(Value::Null),
        );
        Value::Object(value)
    }
}

/// Capability that executes one workflow step type
#[async_trait::async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, request: &StepRequest) -> Result<Value>;
}

pub struct FnStepExecutor<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> StepExecutor for FnStepExecutor<F>
where
    F: Fn(StepRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn execute(&self, request: &StepRequest) -> Result<Value> {
        (self.0)(request.clone()).await
    }
}

/// Returns its flattened request, useful for wiring and dry runs
pub struct EchoStep;

#[async_trait::async_trait]
impl StepExecutor for EchoStep {
    async fn execute(&self, request: &StepRequest) -> Result<Value> {
        Ok(request.to_value())
    }
}

/// Sleeps for `config.ms` milliseconds, honouring cancellation
pub struct DelayStep;

#[async_trait::async_trait]
impl StepExecutor for DelayStep {
    async fn execute(&self, request: &StepRequest) -> Result<Value> {
        let ms = request.config.get("ms").and_then(Value::as_u64).unwrap_or(0);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!({ "slept_ms": ms })),
            _ = request.cancel_token.cancelled() => anyhow::bail!("delay cancelled after partial wait"),
        }
    }
}

/// Runs each attempt as a task on a [`TaskManager`] and waits for it.
///
/// Step config: `task_type` (required), `input` (defaults to the flattened
/// request), `priority`, `max_attempts`, `timeout_ms`. Cancelling the step
/// cancels the task.
#[derive(Clone)]
pub struct TaskStep {
    manager: TaskManager,
}

#[derive(Debug, Deserialize)]
struct TaskStepConfig {
    task_type: String,
    #[serde(default)]
    input: Option<Value>,
    #[serde(default)]
    priority: Option<TaskPriority>,
    #[serde(default)]
    max_attempts: Option<u32>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

impl TaskStep {
    pub fn new(manager: TaskManager) -> Self {
        Self { manager }
    }
}

#[async_trait::async_trait]
impl StepExecutor for TaskStep {
    async fn execute(&self, request: &StepRequest) -> Result<Value> {
        let config: TaskStepConfig = serde_json::from_value(request.config.clone())
            .with_context(|| format!("Invalid task config for step {}", request.step_id))?;

        let options = TaskOptions {
            priority: config.priority,
            max_attempts: config.max_attempts,
            timeout: config.timeout_ms.map(Duration::from_millis),
            ..Default::default()
        };
        let input = config.input.unwrap_or_else(|| request.to_value());
        let task = self
            .manager
            .submit_task(config.task_type, input, options)
            .await?;

        let done = tokio::select! {
            done = self.manager.wait_for_task(&task.id) => done?,
            _ = request.cancel_token.cancelled() => {
                self.manager.cancel_task(&task.id).await?;
                anyhow::bail!("step cancelled, task {} cancelled with it", task.id);
            }
        };
        match done.status {
            TaskStatus::Completed => Ok(done.output.unwrap_or(Value::Null)),
            status => {
                let reason = done.error.map(|e| e.message).unwrap_or_default();
                anyhow::bail!("task {} ended {}: {}", done.id, status, reason)
            }
        }
    }
}

/// Step executors keyed by step type
#[derive(Clone, Default)]
pub struct StepRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `echo` and `delay`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("echo", Arc::new(EchoStep));
        registry.register("delay", Arc::new(DelayStep));
        registry
    }

    /// Add the `task` step type, backed by `manager`
    pub fn with_task_step(mut self, manager: TaskManager) -> Self {
        self.register("task", Arc::new(TaskStep::new(manager)));
        self
    }

    pub fn register(&mut self, step_type: impl Into<String>, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(step_type.into(), executor);
    }

    pub fn register_fn<F, Fut>(&mut self, step_type: impl Into<String>, f: F)
    where
        F: Fn(StepRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(step_type, Arc::new(FnStepExecutor(f)));
    }

    pub fn has_capability(&self, step_type: &str) -> bool {
        self.executors.contains_key(step_type)
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(step_type).cloned()
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.executors.keys().collect();
        types.sort();
        f.debug_struct("StepRegistry").field("types", &types).finish()
    }
}
