use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::time::Duration;

/// Named DAG of steps with shared context
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Workflow {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default)]
    pub context: WorkflowContext,
    #[serde(default)]
    pub metadata: WorkflowMetadata,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

/// Shared state threaded through a workflow run
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct WorkflowContext {
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default)]
    pub output: Option<Value>,
    /// Insertion order is completion order
    #[serde(default)]
    pub step_results: IndexMap<String, Value>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    /// Append-only failure log
    #[serde(default)]
    pub errors: Vec<StepError>,
    /// Steps whose condition evaluated false; each also has a `null` result
    #[serde(default)]
    pub skipped: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct WorkflowMetadata {
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One failed step attempt
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StepError {
    pub step_id: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    pub attempt: u32,
}

/// A node of the workflow graph
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: String,
    /// Step ids that must have results first
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub condition: Option<StepCondition>,
}

/// Exponential backoff policy for a step
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

/// Guard deciding whether a step runs or is skipped
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepCondition {
    VariableEquals { name: String, value: Value },
    VariableExists { name: String },
    /// Compare a value inside a prior step's result, addressed by JSON pointer
    ResultEquals {
        step: String,
        #[serde(default)]
        pointer: String,
        value: Value,
    },
    Not { condition: Box<StepCondition> },
}

impl Workflow {
    pub fn new(id: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            id: id.into(),
            name: None,
            steps,
            status: WorkflowStatus::Pending,
            context: WorkflowContext::default(),
            metadata: WorkflowMetadata {
                created_at: Some(Utc::now()),
                ..Default::default()
            },
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_input(mut self, input: Map<String, Value>) -> Self {
        self.context.input = input;
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.context.variables.insert(name.into(), value);
        self
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            WorkflowStatus::Completed | WorkflowStatus::Failed
        )
    }

    /// Running or paused workflows occupy a capacity slot
    pub fn is_active(&self) -> bool {
        matches!(self.status, WorkflowStatus::Running | WorkflowStatus::Paused)
    }

    /// True once every step has a recorded result
    pub fn all_steps_done(&self) -> bool {
        self.steps
            .iter()
            .all(|s| self.context.step_results.contains_key(&s.id))
    }

    /// Steps without a result, not in flight, whose dependencies all have results
    pub fn ready_frontier(&self, in_flight: &HashSet<String>) -> Vec<&WorkflowStep> {
        self.steps
            .iter()
            .filter(|s| !self.context.step_results.contains_key(&s.id))
            .filter(|s| !in_flight.contains(&s.id))
            .filter(|s| {
                s.dependencies
                    .iter()
                    .all(|d| self.context.step_results.contains_key(d))
            })
            .collect()
    }

    /// Number of recorded failures for a step
    pub fn error_count(&self, step_id: &str) -> u32 {
        self.context
            .errors
            .iter()
            .filter(|e| e.step_id == step_id)
            .count() as u32
    }
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            step_type: step_type.into(),
            dependencies: Vec::new(),
            config: Value::Null,
            retry_policy: None,
            timeout_ms: None,
            condition: None,
        }
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.push(step_id.into());
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_condition(mut self, condition: StepCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        backoff_multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: initial_delay.as_millis() as u64,
            backoff_multiplier,
            max_delay_ms: max_delay.as_millis() as u64,
        }
    }

    /// Delay before retrying after failed attempt `attempt` (1-based):
    /// `min(initial_delay * multiplier^(attempt - 1), max_delay)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = if delay.is_finite() {
            delay.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `failures` recorded failures
    pub fn allows_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}

impl StepCondition {
    pub fn evaluate(&self, context: &WorkflowContext) -> bool {
        match self {
            StepCondition::VariableEquals { name, value } => {
                context.variables.get(name) == Some(value)
            }
            StepCondition::VariableExists { name } => context.variables.contains_key(name),
            StepCondition::ResultEquals {
                step,
                pointer,
                value,
            } => context
                .step_results
                .get(step)
                .and_then(|result| result.pointer(pointer))
                == Some(value),
            StepCondition::Not { condition } => !condition.evaluate(context),
        }
    }
}
