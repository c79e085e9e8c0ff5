use crate::error::{EngineError, Result};
use crate::task::types::*;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Output of a strategy: independent children plus the task that merges them
#[derive(Debug, Clone)]
pub struct Decomposition {
    pub children: Vec<Task>,
    pub consolidation: Task,
}

/// Per-type policy for splitting oversized tasks
pub trait DecompositionStrategy: Send + Sync {
    /// Pure predicate, evaluated once before the task executes
    fn should_decompose(&self, task: &Task) -> bool;

    /// Split the task. Must succeed for any task `should_decompose` accepts.
    fn decompose(&self, task: &Task) -> anyhow::Result<Decomposition>;
}

/// Registry of decomposition strategies keyed by task type
#[derive(Clone, Default)]
pub struct TaskDecomposer {
    strategies: HashMap<String, Arc<dyn DecompositionStrategy>>,
}

impl TaskDecomposer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        task_type: impl Into<String>,
        strategy: Arc<dyn DecompositionStrategy>,
    ) {
        let task_type = task_type.into();
        debug!("Registered decomposition strategy for '{}'", task_type);
        self.strategies.insert(task_type, strategy);
    }

    pub fn has_strategy(&self, task_type: &str) -> bool {
        self.strategies.contains_key(task_type)
    }

    /// A task without a registered strategy is never decomposed
    pub fn should_decompose(&self, task: &Task) -> bool {
        self.strategies
            .get(&task.task_type)
            .is_some_and(|strategy| strategy.should_decompose(task))
    }

    /// Split `parent` into children followed by exactly one consolidation task.
    ///
    /// Children and the consolidation task inherit the parent's priority and
    /// attempt budget, point back at the parent, and the consolidation task
    /// hard-depends on every child.
    pub fn decompose(&self, parent: &Task) -> Result<Vec<Task>> {
        let strategy = self.strategies.get(&parent.task_type).ok_or_else(|| {
            decomposition_error(parent, "no strategy registered for this task type")
        })?;

        let Decomposition {
            mut children,
            mut consolidation,
        } = strategy
            .decompose(parent)
            .map_err(|e| decomposition_error(parent, &e.to_string()))?;

        if children.is_empty() {
            return Err(decomposition_error(parent, "strategy produced no children"));
        }

        let mut ids = HashSet::new();
        ids.insert(parent.id.clone());
        for child in &children {
            if !ids.insert(child.id.clone()) {
                return Err(decomposition_error(
                    parent,
                    &format!("duplicate subtask id {}", child.id),
                ));
            }
        }
        if ids.contains(&consolidation.id) {
            return Err(decomposition_error(
                parent,
                "consolidation task id collides with a child or the parent",
            ));
        }

        for child in &children {
            if let Some(dep) = child
                .dependencies
                .iter()
                .find(|d| ids.contains(&d.task_id) || d.task_id == consolidation.id)
            {
                return Err(decomposition_error(
                    parent,
                    &format!("child {} depends on sibling {}", child.id, dep.task_id),
                ));
            }
        }

        for child in children.iter_mut() {
            inherit_policy(child, parent);
        }
        inherit_policy(&mut consolidation, parent);
        consolidation.metadata.consolidates = Some(parent.id.clone());
        for child in &children {
            if !consolidation
                .dependencies
                .iter()
                .any(|d| d.task_id == child.id)
            {
                consolidation
                    .dependencies
                    .push(TaskDependency::hard(child.id.clone()));
            }
        }
        for dep in consolidation.dependencies.iter_mut() {
            if children.iter().any(|c| c.id == dep.task_id) {
                dep.kind = DependencyKind::Hard;
            }
        }

        info!(
            "Decomposed task {} into {} subtasks plus consolidation {}",
            parent.id,
            children.len(),
            consolidation.id
        );

        children.push(consolidation);
        Ok(children)
    }
}

fn inherit_policy(task: &mut Task, parent: &Task) {
    task.priority = parent.priority;
    task.metadata.max_attempts = parent.metadata.max_attempts;
    task.metadata.attempts = 0;
    task.status = TaskStatus::Pending;
    task.parent_task_id = Some(parent.id.clone());
    if task.timeout_ms.is_none() {
        task.timeout_ms = parent.timeout_ms;
    }
}

fn decomposition_error(task: &Task, reason: &str) -> EngineError {
    EngineError::Decomposition {
        task_id: task.id.clone(),
        reason: reason.to_string(),
    }
}

impl std::fmt::Debug for TaskDecomposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.strategies.keys().collect();
        types.sort();
        f.debug_struct("TaskDecomposer")
            .field("strategies", &types)
            .finish()
    }
}

/// Splits a task whose input holds an array longer than `chunk_size`.
///
/// With `field` set the array is read from that key of an input object and
/// each child receives a copy of the object with the field replaced by its
/// chunk; otherwise the input itself must be the array and each child gets
/// its chunk as input. The consolidation task receives the parent id and the
/// ordered child ids.
#[derive(Debug, Clone)]
pub struct ChunkedInputStrategy {
    pub field: Option<String>,
    pub chunk_size: usize,
    /// Child task type; defaults to the parent's type
    pub child_type: Option<String>,
    pub consolidation_type: String,
}

impl ChunkedInputStrategy {
    pub fn new(chunk_size: usize, consolidation_type: impl Into<String>) -> Self {
        Self {
            field: None,
            chunk_size,
            child_type: None,
            consolidation_type: consolidation_type.into(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_child_type(mut self, child_type: impl Into<String>) -> Self {
        self.child_type = Some(child_type.into());
        self
    }

    fn items<'a>(&self, input: &'a Value) -> Option<&'a Vec<Value>> {
        match &self.field {
            Some(field) => input.get(field).and_then(Value::as_array),
            None => input.as_array(),
        }
    }
}

impl DecompositionStrategy for ChunkedInputStrategy {
    fn should_decompose(&self, task: &Task) -> bool {
        self.chunk_size > 0
            && self
                .items(&task.input)
                .is_some_and(|items| items.len() > self.chunk_size)
    }

    fn decompose(&self, task: &Task) -> anyhow::Result<Decomposition> {
        if self.chunk_size == 0 {
            anyhow::bail!("chunk size must be positive");
        }
        let items = self
            .items(&task.input)
            .ok_or_else(|| anyhow::anyhow!("input has no array to split"))?;

        let child_type = self.child_type.as_deref().unwrap_or(&task.task_type);
        let children: Vec<Task> = items
            .chunks(self.chunk_size)
            .enumerate()
            .map(|(index, chunk)| {
                let input = match &self.field {
                    Some(field) => {
                        let mut input = task.input.clone();
                        input[field.as_str()] = Value::Array(chunk.to_vec());
                        input
                    }
                    None => Value::Array(chunk.to_vec()),
                };
                Task::new(child_type, input).with_id(format!("{}-part-{}", task.id, index))
            })
            .collect();

        let child_ids: Vec<_> = children.iter().map(|c| c.id.clone()).collect();
        let consolidation = Task::new(
            self.consolidation_type.clone(),
            json!({
                "parent_task_id": task.id,
                "children": child_ids,
            }),
        )
        .with_id(format!("{}-consolidate", task.id));

        Ok(Decomposition {
            children,
            consolidation,
        })
    }
}
