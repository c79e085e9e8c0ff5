use crate::error::{EngineError, Result};
use crate::events::{EventBus, EventHandler, LifecycleEvent};
use crate::resources::{ResourceSampler, ResourceSnapshot, SystemResourceSampler};
use crate::storage::{StateStore, StoredRecord, WriteBehind};
use crate::task::decomposer::TaskDecomposer;
use crate::task::execution::{ExecutionContext, ExecutorRegistry, TaskExecutor};
use crate::task::queue::PriorityTaskQueue;
use crate::task::types::*;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, broadcast};
use tracing::{debug, error, info, warn};

/// Central task management system.
///
/// Owns the priority queue, the running set and every finished task. All of
/// it lives behind one mutex; executors run on spawned tasks and report back
/// through [`TaskManager::finish_attempt`]. Cheap to clone.
#[derive(Clone)]
pub struct TaskManager {
    state: Arc<Mutex<ManagerState>>,
    executors: Arc<ExecutorRegistry>,
    decomposer: Arc<TaskDecomposer>,
    sampler: Arc<dyn ResourceSampler>,
    events: Arc<EventBus>,
    writer: Option<WriteBehind>,
    store: Option<Arc<dyn StateStore>>,
    config: TaskManagerConfig,
    /// Signalled whenever a slot frees up or a task reaches a terminal state
    wake: Arc<Notify>,
}

/// Configuration for task manager
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskManagerConfig {
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default)]
    pub default_priority: TaskPriority,
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    #[serde(default = "default_threshold")]
    pub cpu_threshold: f64,
    #[serde(default = "default_threshold")]
    pub memory_threshold: f64,
    #[serde(default = "default_true")]
    pub resource_check_enabled: bool,
    /// Pause before re-sampling when over a threshold
    #[serde(default = "default_resource_backoff_ms")]
    pub resource_backoff_ms: u64,
    /// Upper bound on how long the loop sleeps when every queued task is
    /// waiting on dependencies
    #[serde(default = "default_dependency_poll_ms")]
    pub dependency_poll_ms: u64,
}

fn default_max_concurrent_tasks() -> usize {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_threshold() -> f64 {
    90.0
}

fn default_true() -> bool {
    true
}

fn default_resource_backoff_ms() -> u64 {
    1000
}

fn default_dependency_poll_ms() -> u64 {
    100
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            default_priority: TaskPriority::Normal,
            default_max_attempts: default_max_attempts(),
            cpu_threshold: default_threshold(),
            memory_threshold: default_threshold(),
            resource_check_enabled: true,
            resource_backoff_ms: default_resource_backoff_ms(),
            dependency_poll_ms: default_dependency_poll_ms(),
        }
    }
}

impl TaskManagerConfig {
    pub fn resource_backoff(&self) -> Duration {
        Duration::from_millis(self.resource_backoff_ms)
    }

    pub fn dependency_poll(&self) -> Duration {
        Duration::from_millis(self.dependency_poll_ms)
    }

    fn over_threshold(&self, snapshot: &ResourceSnapshot) -> bool {
        snapshot.cpu_percent > self.cpu_threshold || snapshot.memory_percent > self.memory_threshold
    }
}

/// Point-in-time statistics over every task the manager knows about
#[derive(Debug, Clone, Serialize)]
pub struct TaskStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<u8, usize>,
    pub by_type: BTreeMap<String, usize>,
    pub queued: usize,
    pub running: usize,
    pub max_concurrent: usize,
    /// Mean start-to-completion time of completed tasks
    pub average_completion_ms: Option<f64>,
    /// Failed share of tasks that reached completed or failed
    pub failure_rate: f64,
    /// Running tasks over the concurrency ceiling
    pub utilization: f64,
    pub resources: ResourceSnapshot,
}

#[derive(Default)]
struct ManagerState {
    queue: PriorityTaskQueue,
    running: HashMap<TaskId, Task>,
    /// Decomposed parents waiting on their consolidation task
    awaiting: HashMap<TaskId, Task>,
    finished: HashMap<TaskId, Task>,
    /// Only read or written under the state lock
    loop_active: bool,
}

enum Readiness {
    Ready,
    Waiting,
    /// A hard dependency can never be met
    Blocked(TaskId),
}

enum Tick {
    Launch(Launch),
    Continue,
    WaitForSlot,
    WaitForDependencies,
    Backoff,
    Idle,
}

struct Launch {
    task: Task,
    executor: Arc<dyn TaskExecutor>,
    context: ExecutionContext,
}

impl ManagerState {
    fn contains(&self, task_id: &str) -> bool {
        self.queue.contains(task_id)
            || self.running.contains_key(task_id)
            || self.awaiting.contains_key(task_id)
            || self.finished.contains_key(task_id)
    }

    fn get(&self, task_id: &str) -> Option<&Task> {
        self.queue
            .get(task_id)
            .or_else(|| self.running.get(task_id))
            .or_else(|| self.awaiting.get(task_id))
            .or_else(|| self.finished.get(task_id))
    }

    fn all_tasks(&self) -> impl Iterator<Item = &Task> {
        self.queue
            .iter()
            .chain(self.running.values())
            .chain(self.awaiting.values())
            .chain(self.finished.values())
    }

    /// Soft dependencies never block. An unknown hard dependency is unmet.
    fn readiness(&self, task: &Task) -> Readiness {
        let mut waiting = false;
        for dependency in task.hard_dependencies() {
            match self.finished.get(&dependency.task_id).map(|t| t.status) {
                Some(TaskStatus::Completed) => {}
                Some(_) => return Readiness::Blocked(dependency.task_id.clone()),
                None => {
                    let expired = dependency.timeout_ms.is_some_and(|timeout_ms| {
                        let waited = Utc::now().signed_duration_since(task.metadata.created_at);
                        waited.num_milliseconds() >= timeout_ms as i64
                    });
                    if expired {
                        return Readiness::Blocked(dependency.task_id.clone());
                    }
                    waiting = true;
                }
            }
        }
        if waiting {
            Readiness::Waiting
        } else {
            Readiness::Ready
        }
    }

    fn dependency_outputs(&self, task: &Task) -> HashMap<TaskId, Value> {
        task.dependencies
            .iter()
            .filter_map(|dependency| {
                let finished = self.finished.get(&dependency.task_id)?;
                let output = finished.output.clone()?;
                Some((dependency.task_id.clone(), output))
            })
            .collect()
    }

    fn requeue(&mut self, task: Task) {
        let task_id = task.id.clone();
        if let Err(e) = self.queue.enqueue(task) {
            error!("Failed to requeue task {}: {}", task_id, e);
        }
    }
}

impl TaskManager {
    /// Create a new task manager sampling the host for resource usage
    pub fn new(config: TaskManagerConfig, executors: ExecutorRegistry) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManagerState::default())),
            executors: Arc::new(executors),
            decomposer: Arc::new(TaskDecomposer::new()),
            sampler: Arc::new(SystemResourceSampler::new()),
            events: Arc::new(EventBus::new()),
            writer: None,
            store: None,
            config,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn with_decomposer(mut self, decomposer: TaskDecomposer) -> Self {
        self.decomposer = Arc::new(decomposer);
        self
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn ResourceSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    /// Share an event bus, e.g. with a workflow coordinator
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Persist every transition to `store`. Requires a running tokio runtime.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.writer = Some(WriteBehind::new(Arc::clone(&store)));
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &TaskManagerConfig {
        &self.config
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub async fn add_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.events.add_handler(handler).await;
    }

    /// Build a task from manager defaults and caller overrides, then queue it
    pub async fn submit_task(
        &self,
        task_type: impl Into<String>,
        input: Value,
        options: TaskOptions,
    ) -> Result<Task> {
        let mut task = Task::new(task_type, input)
            .with_priority(options.priority.unwrap_or(self.config.default_priority))
            .with_max_attempts(
                options
                    .max_attempts
                    .unwrap_or(self.config.default_max_attempts),
            );
        if let Some(id) = options.id {
            task = task.with_id(id);
        }
        for dependency in options.dependencies {
            task = task.with_dependency(dependency);
        }
        if let Some(timeout) = options.timeout {
            task = task.with_timeout(timeout);
        }
        self.submit(task).await
    }

    /// Queue a fully built task. Fails synchronously if the id is already
    /// known or nothing can run its type.
    pub async fn submit(&self, mut task: Task) -> Result<Task> {
        if !self.executors.has_capability(&task.task_type)
            && !self.decomposer.has_strategy(&task.task_type)
        {
            return Err(EngineError::NoExecutor(task.task_type));
        }

        task.status = TaskStatus::Pending;
        let event = LifecycleEvent::TaskSubmitted {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            priority: task.priority,
            at: Utc::now(),
        };

        {
            let mut state = self.state.lock().await;
            if state.contains(&task.id) {
                return Err(EngineError::DuplicateTask(task.id));
            }
            state.queue.enqueue(task.clone())?;
            self.persist(&task);
            self.start_loop_if_idle(&mut state);
        }

        debug!(
            "Submitted task {} ({}, priority {})",
            task.id,
            task.task_type,
            task.priority.value()
        );
        self.events.emit(event).await;
        Ok(task)
    }

    /// Cancel a queued or running task and, recursively, its subtasks.
    ///
    /// Cancelling a consolidation task also cancels the decomposed parent it
    /// would have resolved, together with the parent's other subtasks.
    /// Terminal tasks are returned unchanged.
    pub async fn cancel_task(&self, task_id: &str) -> Result<Task> {
        let mut events = Vec::new();
        let cancelled = {
            let mut state = self.state.lock().await;
            if let Some(task) = state.finished.get(task_id) {
                return Ok(task.clone());
            }
            if !state.contains(task_id) {
                return Err(EngineError::TaskNotFound(task_id.to_string()));
            }

            let mut pending = vec![task_id.to_string()];
            let mut root = None;
            while let Some(id) = pending.pop() {
                let Some(mut task) = state
                    .queue
                    .remove(&id)
                    .or_else(|| state.running.remove(&id))
                    .or_else(|| state.awaiting.remove(&id))
                else {
                    continue;
                };

                task.cancel_token.cancel();
                task.status = TaskStatus::Cancelled;
                task.metadata.completed_at = Some(Utc::now());
                if let Some(subtasks) = &task.subtasks {
                    pending.extend(subtasks.iter().cloned());
                }
                if let Some(parent_id) = &task.metadata.consolidates
                    && state.awaiting.contains_key(parent_id)
                {
                    pending.push(parent_id.clone());
                }

                info!("Cancelled task {}", task.id);
                events.push(LifecycleEvent::TaskCancelled {
                    task_id: task.id.clone(),
                    at: Utc::now(),
                });
                self.persist(&task);
                if root.is_none() {
                    root = Some(task.clone());
                }
                state.finished.insert(task.id.clone(), task);
            }
            root
        };

        self.wake.notify_one();
        for event in events {
            self.events.emit(event).await;
        }
        cancelled.ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))
    }

    pub async fn get_task(&self, task_id: &str) -> Option<Task> {
        self.state.lock().await.get(task_id).cloned()
    }

    /// Every known task matching `filter`, in no particular order
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        let state = self.state.lock().await;
        state
            .all_tasks()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect()
    }

    /// Resolve once the task reaches a terminal state
    pub async fn wait_for_task(&self, task_id: &str) -> Result<Task> {
        let mut events = self.events.subscribe();
        loop {
            match self.get_task(task_id).await {
                Some(task) if task.is_terminal() => return Ok(task),
                Some(_) => {}
                None => return Err(EngineError::TaskNotFound(task_id.to_string())),
            }

            loop {
                match events.recv().await {
                    Ok(event) if event.task_id() == Some(task_id) => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(EngineError::TaskNotFound(task_id.to_string()));
                    }
                }
            }
        }
    }

    pub async fn task_stats(&self) -> TaskStats {
        let resources = self.sampler.sample();
        let state = self.state.lock().await;

        let mut by_status = BTreeMap::new();
        let mut by_priority = BTreeMap::new();
        let mut by_type = BTreeMap::new();
        let mut total = 0;
        for task in state.all_tasks() {
            total += 1;
            *by_status.entry(task.status.to_string()).or_insert(0) += 1;
            *by_priority.entry(task.priority.value()).or_insert(0) += 1;
            *by_type.entry(task.task_type.clone()).or_insert(0) += 1;
        }

        let completion_times: Vec<f64> = state
            .finished
            .values()
            .filter(|task| task.status == TaskStatus::Completed)
            .filter_map(|task| task.completion_time())
            .map(|elapsed| elapsed.num_milliseconds() as f64)
            .collect();
        let average_completion_ms = (!completion_times.is_empty())
            .then(|| completion_times.iter().sum::<f64>() / completion_times.len() as f64);

        let completed = by_status.get("completed").copied().unwrap_or(0);
        let failed = by_status.get("failed").copied().unwrap_or(0);
        let failure_rate = if completed + failed > 0 {
            failed as f64 / (completed + failed) as f64
        } else {
            0.0
        };

        let max_concurrent = self.config.max_concurrent_tasks;
        TaskStats {
            total,
            by_status,
            by_priority,
            by_type,
            queued: state.queue.len(),
            running: state.running.len(),
            max_concurrent,
            average_completion_ms,
            failure_rate,
            utilization: state.running.len() as f64 / max_concurrent.max(1) as f64,
            resources,
        }
    }

    /// Replay persisted tasks: unfinished work is queued again (running
    /// attempts restart as pending), finished tasks are kept for dependency
    /// checks. Returns how many tasks were loaded.
    pub async fn restore(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let records = store.list_all().await?;

        let mut restored = 0;
        let mut state = self.state.lock().await;
        for record in records {
            let StoredRecord::Task(mut task) = record else {
                continue;
            };
            if state.contains(&task.id) {
                continue;
            }
            restored += 1;

            if task.is_terminal() {
                state.finished.insert(task.id.clone(), task);
            } else if task.is_decomposed() {
                state.awaiting.insert(task.id.clone(), task);
            } else {
                task.reset_for_retry();
                state.requeue(task);
            }
        }
        self.start_loop_if_idle(&mut state);

        info!("Restored {} tasks from store", restored);
        Ok(restored)
    }

    /// Wait until every transition so far has been handed to the store
    pub async fn flush_store(&self) {
        if let Some(writer) = &self.writer {
            writer.flush().await;
        }
    }

    fn persist(&self, task: &Task) {
        if let Some(writer) = &self.writer {
            writer.save(StoredRecord::Task(task.clone()));
        }
    }

    /// At most one scheduling loop runs per manager
    fn start_loop_if_idle(&self, state: &mut ManagerState) {
        if !state.loop_active && !state.queue.is_empty() {
            state.loop_active = true;
            tokio::spawn(self.clone().run_loop());
        }
    }

    async fn run_loop(self) {
        debug!("Scheduling loop started");
        loop {
            let snapshot = self
                .config
                .resource_check_enabled
                .then(|| self.sampler.sample());

            let mut events = Vec::new();
            let tick = {
                let mut state = self.state.lock().await;
                self.tick(&mut state, snapshot, &mut events)
            };
            for event in events {
                self.events.emit(event).await;
            }

            match tick {
                Tick::Launch(launch) => self.launch(launch),
                Tick::Continue => {}
                Tick::WaitForSlot => self.wake.notified().await,
                Tick::WaitForDependencies => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.dependency_poll()) => {}
                        _ = self.wake.notified() => {}
                    }
                }
                Tick::Backoff => tokio::time::sleep(self.config.resource_backoff()).await,
                Tick::Idle => break,
            }
        }
        debug!("Scheduling loop idle");
    }

    /// One admission decision, made entirely under the state lock
    fn tick(
        &self,
        state: &mut ManagerState,
        snapshot: Option<ResourceSnapshot>,
        events: &mut Vec<LifecycleEvent>,
    ) -> Tick {
        if state.running.len() >= self.config.max_concurrent_tasks {
            return Tick::WaitForSlot;
        }

        // Tasks waiting on dependencies are held aside so lower priorities can
        // still be admitted, then put back in the order they came out.
        let mut held = Vec::new();
        let mut blocked_any = false;
        let mut selected = None;
        while let Some(task) = state.queue.dequeue() {
            match state.readiness(&task) {
                Readiness::Ready => {
                    selected = Some(task);
                    break;
                }
                Readiness::Waiting => held.push(task),
                Readiness::Blocked(dependency) => {
                    let error = EngineError::DependencyUnmet {
                        task_id: task.id.clone(),
                        dependency,
                    };
                    self.fail_terminally(state, task, &error, events);
                    blocked_any = true;
                }
            }
        }
        let waiting = !held.is_empty();
        for task in held {
            state.requeue(task);
        }

        let Some(mut task) = selected else {
            if waiting && blocked_any {
                return Tick::Continue;
            }
            if waiting {
                return Tick::WaitForDependencies;
            }
            state.loop_active = false;
            return Tick::Idle;
        };

        if let Some(snapshot) = snapshot
            && self.config.over_threshold(&snapshot)
        {
            debug!(
                "Deferring task {}: cpu {:.1}%, memory {:.1}%",
                task.id, snapshot.cpu_percent, snapshot.memory_percent
            );
            state.requeue(task);
            return Tick::Backoff;
        }

        if task.metadata.attempts == 0 && self.decomposer.should_decompose(&task) {
            self.decompose(state, task, events);
            return Tick::Continue;
        }

        let Some(executor) = self.executors.get(&task.task_type) else {
            let error = EngineError::NoExecutor(task.task_type.clone());
            self.fail_terminally(state, task, &error, events);
            return Tick::Continue;
        };

        let attempt = task.metadata.attempts + 1;
        task.status = TaskStatus::Running;
        task.metadata.started_at = Some(Utc::now());
        let context = ExecutionContext {
            task_id: task.id.clone(),
            attempt,
            dependency_outputs: state.dependency_outputs(&task),
            // Per-attempt token: a timeout must not poison later attempts
            cancel_token: task.cancel_token.child_token(),
        };

        debug!("Starting task {} (attempt {})", task.id, attempt);
        events.push(LifecycleEvent::TaskStarted {
            task_id: task.id.clone(),
            attempt,
            at: Utc::now(),
        });
        self.persist(&task);
        state.running.insert(task.id.clone(), task.clone());

        Tick::Launch(Launch {
            task,
            executor,
            context,
        })
    }

    fn decompose(&self, state: &mut ManagerState, mut parent: Task, events: &mut Vec<LifecycleEvent>) {
        let subtasks = match self.decomposer.decompose(&parent) {
            Ok(subtasks) => subtasks,
            Err(e) => {
                self.fail_terminally(state, parent, &e, events);
                return;
            }
        };
        if let Some(existing) = subtasks.iter().find(|t| state.contains(&t.id)) {
            let error = EngineError::Decomposition {
                task_id: parent.id.clone(),
                reason: format!("subtask id {} already exists", existing.id),
            };
            self.fail_terminally(state, parent, &error, events);
            return;
        }

        let subtask_ids: Vec<TaskId> = subtasks.iter().map(|t| t.id.clone()).collect();
        parent.status = TaskStatus::Running;
        parent.metadata.started_at = Some(Utc::now());
        parent.subtasks = Some(subtask_ids.clone());
        self.persist(&parent);
        events.push(LifecycleEvent::TaskDecomposed {
            task_id: parent.id.clone(),
            subtask_ids,
            at: Utc::now(),
        });
        state.awaiting.insert(parent.id.clone(), parent);

        for subtask in subtasks {
            events.push(LifecycleEvent::TaskSubmitted {
                task_id: subtask.id.clone(),
                task_type: subtask.task_type.clone(),
                priority: subtask.priority,
                at: Utc::now(),
            });
            self.persist(&subtask);
            state.requeue(subtask);
        }
    }

    /// Run one attempt on its own task. A timeout cancels the attempt token
    /// and records the failure; the executor is detached, not aborted.
    fn launch(&self, launch: Launch) {
        let Launch {
            task,
            executor,
            context,
        } = launch;
        let manager = self.clone();
        let timeout = task.timeout();
        let task_id = task.id.clone();
        let attempt_token = context.cancel_token.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let mut handle = tokio::spawn(async move { executor.execute(&task, &context).await });

            let joined = match timeout {
                Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                    Ok(joined) => Some(joined),
                    Err(_) => {
                        attempt_token.cancel();
                        None
                    }
                },
                None => Some(handle.await),
            };

            let outcome = match joined {
                Some(Ok(Ok(output))) => Ok(output),
                Some(Ok(Err(e))) => Err(EngineError::Execution(format!("{:#}", e))),
                Some(Err(join_error)) => Err(EngineError::Execution(format!(
                    "executor panicked: {}",
                    join_error
                ))),
                None => Err(EngineError::Execution(format!(
                    "timed out after {}ms",
                    timeout.map(|t| t.as_millis()).unwrap_or_default()
                ))),
            };
            manager
                .finish_attempt(&task_id, outcome, started.elapsed())
                .await;
        });
    }

    /// Record the outcome of one attempt. Results for tasks that are no
    /// longer running (cancelled meanwhile) are dropped.
    async fn finish_attempt(&self, task_id: &str, outcome: Result<Value>, elapsed: Duration) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock().await;
            let Some(mut task) = state.running.remove(task_id) else {
                debug!("Discarding result of task {} that is no longer running", task_id);
                return;
            };

            match outcome {
                Ok(output) => {
                    let usage = self.sampler.sample();
                    task.status = TaskStatus::Completed;
                    task.metadata.completed_at = Some(Utc::now());
                    task.metadata.resource_usage = Some(ResourceUsage {
                        cpu_percent: usage.cpu_percent,
                        memory_percent: usage.memory_percent,
                        wall_time_ms: elapsed.as_millis() as u64,
                    });
                    task.output = Some(output.clone());

                    info!("Completed task {}", task.id);
                    events.push(LifecycleEvent::TaskCompleted {
                        task_id: task.id.clone(),
                        output,
                        at: Utc::now(),
                    });
                    self.persist(&task);
                    self.resolve_parent(&mut state, &task, &mut events);
                    state.finished.insert(task.id.clone(), task);
                }
                Err(error) => {
                    task.metadata.attempts += 1;
                    let record = task.record_failure(&error);

                    if task.attempts_remaining() {
                        warn!(
                            "Task {} failed (attempt {}/{}), requeueing: {}",
                            task.id, task.metadata.attempts, task.metadata.max_attempts, error
                        );
                        events.push(LifecycleEvent::TaskFailed {
                            task_id: task.id.clone(),
                            error: record.message,
                            attempt: task.metadata.attempts,
                            will_retry: true,
                            at: Utc::now(),
                        });
                        task.reset_for_retry();
                        self.persist(&task);
                        state.requeue(task);
                    } else {
                        task.status = TaskStatus::Failed;
                        task.error = Some(record);
                        task.metadata.completed_at = Some(Utc::now());
                        self.finalize_failure(&mut state, task, &mut events);
                    }
                }
            }
            self.start_loop_if_idle(&mut state);
        }

        self.wake.notify_one();
        for event in events {
            self.events.emit(event).await;
        }
    }

    /// Fail a task without running it again
    fn fail_terminally(
        &self,
        state: &mut ManagerState,
        mut task: Task,
        error: &EngineError,
        events: &mut Vec<LifecycleEvent>,
    ) {
        let record = task.record_failure(error);
        task.status = TaskStatus::Failed;
        task.error = Some(record);
        task.metadata.completed_at = Some(Utc::now());
        self.finalize_failure(state, task, events);
    }

    fn finalize_failure(&self, state: &mut ManagerState, task: Task, events: &mut Vec<LifecycleEvent>) {
        let message = task
            .error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_default();
        warn!("Task {} failed permanently: {}", task.id, message);
        events.push(LifecycleEvent::TaskFailed {
            task_id: task.id.clone(),
            error: message,
            attempt: task.metadata.attempts,
            will_retry: false,
            at: Utc::now(),
        });
        self.persist(&task);
        self.resolve_parent(state, &task, events);
        state.finished.insert(task.id.clone(), task);
    }

    /// A decomposed parent takes the outcome of its consolidation task
    fn resolve_parent(&self, state: &mut ManagerState, child: &Task, events: &mut Vec<LifecycleEvent>) {
        let Some(parent_id) = &child.metadata.consolidates else {
            return;
        };
        let Some(mut parent) = state.awaiting.remove(parent_id) else {
            return;
        };

        parent.metadata.completed_at = Some(Utc::now());
        match child.status {
            TaskStatus::Completed => {
                parent.status = TaskStatus::Completed;
                parent.output = child.output.clone();
                info!("Completed decomposed task {} via {}", parent.id, child.id);
                events.push(LifecycleEvent::TaskCompleted {
                    task_id: parent.id.clone(),
                    output: parent.output.clone().unwrap_or(Value::Null),
                    at: Utc::now(),
                });
                self.persist(&parent);
                self.resolve_parent(state, &parent, events);
                state.finished.insert(parent.id.clone(), parent);
            }
            _ => {
                let error = EngineError::Execution(format!(
                    "consolidation task {} did not complete",
                    child.id
                ));
                let record = parent.record_failure(&error);
                parent.status = TaskStatus::Failed;
                parent.error = Some(record);
                self.finalize_failure(state, parent, events);
            }
        }
    }
}
