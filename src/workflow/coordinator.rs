use crate::error::{EngineError, Result};
use crate::events::{EventBus, FnEventHandler, LifecycleEvent};
use crate::storage::{StateStore, StoredRecord, WriteBehind};
use crate::workflow::registry::{StepExecutor, StepRegistry, StepRequest};
use crate::workflow::types::*;
use crate::workflow::validation::validate_workflow;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the workflow coordinator
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Running plus paused workflows allowed at once
    #[serde(default = "default_max_active_workflows")]
    pub max_active_workflows: usize,
    /// Applied to steps that set no timeout of their own
    #[serde(default)]
    pub default_step_timeout_ms: Option<u64>,
}

fn default_max_active_workflows() -> usize {
    10
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_active_workflows: default_max_active_workflows(),
            default_step_timeout_ms: None,
        }
    }
}

/// Builds `context.output` once every step has a result
pub trait OutputAggregator: Send + Sync {
    fn aggregate(&self, context: &WorkflowContext) -> Value;
}

impl<F> OutputAggregator for F
where
    F: Fn(&WorkflowContext) -> Value + Send + Sync,
{
    fn aggregate(&self, context: &WorkflowContext) -> Value {
        self(context)
    }
}

/// Default aggregation: the full step result map, in completion order
pub struct FullResultsAggregator;

impl OutputAggregator for FullResultsAggregator {
    fn aggregate(&self, context: &WorkflowContext) -> Value {
        Value::Object(
            context
                .step_results
                .iter()
                .map(|(id, result)| (id.clone(), result.clone()))
                .collect(),
        )
    }
}

/// Executes workflows as DAGs of steps.
///
/// Every ready step is launched concurrently on its own tokio task; results
/// come back through a single mutex that owns all workflow state.
#[derive(Clone)]
pub struct WorkflowCoordinator {
    state: Arc<Mutex<CoordinatorState>>,
    registry: Arc<StepRegistry>,
    events: Arc<EventBus>,
    aggregator: Arc<dyn OutputAggregator>,
    writer: Option<WriteBehind>,
    store: Option<Arc<dyn StateStore>>,
    config: CoordinatorConfig,
}

#[derive(Default)]
struct CoordinatorState {
    workflows: HashMap<String, Workflow>,
    /// Steps launched or waiting out a retry delay
    in_flight: HashMap<String, HashSet<String>>,
    tokens: HashMap<String, CancellationToken>,
    /// Current run of each workflow id; a restarted id gets a new one
    runs: HashMap<String, u64>,
    next_run: u64,
}

struct StepLaunch {
    executor: Arc<dyn StepExecutor>,
    request: StepRequest,
    run: u64,
    timeout: Option<Duration>,
}

impl CoordinatorState {
    fn active_count(&self) -> usize {
        self.workflows.values().filter(|w| w.is_active()).count()
    }

    fn admit(&mut self, workflow: Workflow) {
        let id = workflow.id.clone();
        self.next_run += 1;
        self.runs.insert(id.clone(), self.next_run);
        self.tokens.insert(id.clone(), CancellationToken::new());
        self.in_flight.insert(id.clone(), HashSet::new());
        self.workflows.insert(id, workflow);
    }

    fn in_flight(&self, workflow_id: &str) -> HashSet<String> {
        self.in_flight.get(workflow_id).cloned().unwrap_or_default()
    }

    /// Whether `step_id` was launched by the current run of `workflow_id`
    /// and has not reported yet
    fn owns(&self, workflow_id: &str, run: u64, step_id: &str) -> bool {
        self.runs.get(workflow_id) == Some(&run)
            && self
                .in_flight
                .get(workflow_id)
                .is_some_and(|steps| steps.contains(step_id))
    }

    fn release(&mut self, workflow_id: &str, step_id: &str) {
        if let Some(steps) = self.in_flight.get_mut(workflow_id) {
            steps.remove(step_id);
        }
    }
}

impl WorkflowCoordinator {
    pub fn new(config: CoordinatorConfig, registry: StepRegistry) -> Self {
        Self {
            state: Arc::new(Mutex::new(CoordinatorState::default())),
            registry: Arc::new(registry),
            events: Arc::new(EventBus::new()),
            aggregator: Arc::new(FullResultsAggregator),
            writer: None,
            store: None,
            config,
        }
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_aggregator(mut self, aggregator: Arc<dyn OutputAggregator>) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Persist every transition to `store`. Requires a running tokio runtime.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.writer = Some(WriteBehind::new(Arc::clone(&store)));
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Validate and start a workflow, launching every step without
    /// dependencies. Nothing starts if this returns an error.
    pub async fn start_workflow(&self, mut workflow: Workflow) -> Result<Workflow> {
        let mut events = Vec::new();
        let (started, launches) = {
            let mut state = self.state.lock().await;

            let active = state.active_count();
            if active >= self.config.max_active_workflows {
                return Err(EngineError::Capacity {
                    active,
                    limit: self.config.max_active_workflows,
                });
            }
            if state
                .workflows
                .get(&workflow.id)
                .is_some_and(|existing| existing.is_active())
            {
                return Err(EngineError::Validation(format!(
                    "workflow {} is already active",
                    workflow.id
                )));
            }
            validate_workflow(&workflow, &self.registry)?;

            workflow.status = WorkflowStatus::Running;
            workflow.metadata.started_at = Some(Utc::now());
            workflow.metadata.completed_at = None;
            if workflow.metadata.created_at.is_none() {
                workflow.metadata.created_at = workflow.metadata.started_at;
            }
            workflow.context.output = None;
            workflow.context.step_results.clear();
            workflow.context.errors.clear();
            workflow.context.skipped.clear();

            let workflow_id = workflow.id.clone();
            info!(
                "Starting workflow {} with {} steps",
                workflow_id,
                workflow.steps.len()
            );
            events.push(LifecycleEvent::WorkflowStarted {
                workflow_id: workflow_id.clone(),
                at: Utc::now(),
            });
            state.admit(workflow);

            let launches = self.advance(&mut state, &workflow_id, &mut events);
            let started = state.workflows.get(&workflow_id).cloned();
            if let Some(workflow) = &started {
                self.persist(workflow);
            }
            (started, launches)
        };

        self.emit_all(events).await;
        for launch in launches {
            self.launch(launch);
        }
        started.ok_or_else(|| EngineError::Validation("workflow vanished during start".into()))
    }

    pub async fn workflow_status(&self, workflow_id: &str) -> Result<WorkflowStatus> {
        let state = self.state.lock().await;
        state
            .workflows
            .get(workflow_id)
            .map(|w| w.status)
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Option<Workflow> {
        self.state.lock().await.workflows.get(workflow_id).cloned()
    }

    pub async fn active_workflows(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state
            .workflows
            .values()
            .filter(|w| w.is_active())
            .map(|w| w.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Stop launching new steps. In-flight steps still record their results.
    pub async fn pause_workflow(&self, workflow_id: &str) -> Result<Workflow> {
        let paused = {
            let mut state = self.state.lock().await;
            let workflow = state
                .workflows
                .get_mut(workflow_id)
                .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;
            if workflow.status != WorkflowStatus::Running {
                return Err(EngineError::Validation(format!(
                    "workflow {} is not running",
                    workflow_id
                )));
            }
            workflow.status = WorkflowStatus::Paused;
            let paused = workflow.clone();
            self.persist(&paused);
            paused
        };

        info!("Paused workflow {}", workflow_id);
        self.events
            .emit(LifecycleEvent::WorkflowPaused {
                workflow_id: workflow_id.to_string(),
                at: Utc::now(),
            })
            .await;
        Ok(paused)
    }

    /// Resume a paused workflow and launch its ready frontier
    pub async fn resume_workflow(&self, workflow_id: &str) -> Result<Workflow> {
        let mut events = Vec::new();
        let (resumed, launches) = {
            let mut state = self.state.lock().await;
            let workflow = state
                .workflows
                .get_mut(workflow_id)
                .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;
            if workflow.status != WorkflowStatus::Paused {
                return Err(EngineError::Validation(format!(
                    "workflow {} is not paused",
                    workflow_id
                )));
            }
            workflow.status = WorkflowStatus::Running;
            events.push(LifecycleEvent::WorkflowResumed {
                workflow_id: workflow_id.to_string(),
                at: Utc::now(),
            });

            let launches = self.advance(&mut state, workflow_id, &mut events);
            let resumed = state.workflows.get(workflow_id).cloned();
            if let Some(workflow) = &resumed {
                self.persist(workflow);
            }
            (resumed, launches)
        };

        info!("Resumed workflow {}", workflow_id);
        self.emit_all(events).await;
        for launch in launches {
            self.launch(launch);
        }
        resumed.ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))
    }

    /// Fail an active workflow and cancel its in-flight steps
    pub async fn cancel_workflow(&self, workflow_id: &str) -> Result<Workflow> {
        let mut events = Vec::new();
        let cancelled = {
            let mut state = self.state.lock().await;
            let Some(workflow) = state.workflows.get_mut(workflow_id) else {
                return Err(EngineError::WorkflowNotFound(workflow_id.to_string()));
            };
            if !workflow.is_active() {
                return Ok(workflow.clone());
            }

            workflow.status = WorkflowStatus::Failed;
            workflow.metadata.completed_at = Some(Utc::now());
            events.push(LifecycleEvent::WorkflowFailed {
                workflow_id: workflow_id.to_string(),
                error: "workflow cancelled".to_string(),
                at: Utc::now(),
            });
            let cancelled = workflow.clone();
            self.persist(&cancelled);

            if let Some(token) = state.tokens.remove(workflow_id) {
                token.cancel();
            }
            state.in_flight.remove(workflow_id);
            cancelled
        };

        info!("Cancelled workflow {}", workflow_id);
        self.emit_all(events).await;
        Ok(cancelled)
    }

    /// Resolve with the workflow once it is completed or failed
    pub async fn wait_for_workflow(&self, workflow_id: &str) -> Result<Workflow> {
        let mut events = self.events.subscribe();
        loop {
            match self.get_workflow(workflow_id).await {
                Some(workflow) if workflow.is_terminal() => return Ok(workflow),
                Some(_) => {}
                None => return Err(EngineError::WorkflowNotFound(workflow_id.to_string())),
            }

            loop {
                match events.recv().await {
                    Ok(LifecycleEvent::WorkflowCompleted { workflow_id: id, .. })
                    | Ok(LifecycleEvent::WorkflowFailed { workflow_id: id, .. })
                        if id == workflow_id =>
                    {
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(EngineError::WorkflowNotFound(workflow_id.to_string()));
                    }
                }
            }
        }
    }

    /// Call `handler` with the workflow id and output of every completed workflow
    pub async fn on_workflow_completed<F>(&self, handler: F)
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.events
            .add_handler(Arc::new(FnEventHandler(move |event: &LifecycleEvent| -> anyhow::Result<()> {
                if let LifecycleEvent::WorkflowCompleted {
                    workflow_id,
                    output,
                    ..
                } = event
                {
                    handler(workflow_id, output);
                }
                Ok(())
            })))
            .await;
    }

    /// Call `handler` with the workflow id and error of every failed workflow
    pub async fn on_workflow_failed<F>(&self, handler: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.events
            .add_handler(Arc::new(FnEventHandler(move |event: &LifecycleEvent| -> anyhow::Result<()> {
                if let LifecycleEvent::WorkflowFailed {
                    workflow_id, error, ..
                } = event
                {
                    handler(workflow_id, error);
                }
                Ok(())
            })))
            .await;
    }

    /// Re-admit persisted workflows. Running ones continue from their
    /// recorded step results, paused ones wait for `resume_workflow`.
    /// Returns how many workflows were loaded.
    pub async fn restore(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let records = store.list_all().await?;

        let mut events = Vec::new();
        let mut launches = Vec::new();
        let mut restored = 0;
        {
            let mut state = self.state.lock().await;
            for record in records {
                let StoredRecord::Workflow(workflow) = record else {
                    continue;
                };
                if state.workflows.contains_key(&workflow.id) {
                    continue;
                }
                restored += 1;

                let workflow_id = workflow.id.clone();
                let running = workflow.status == WorkflowStatus::Running;
                state.admit(workflow);
                if running {
                    launches.extend(self.advance(&mut state, &workflow_id, &mut events));
                }
            }
        }

        info!("Restored {} workflows from store", restored);
        self.emit_all(events).await;
        for launch in launches {
            self.launch(launch);
        }
        Ok(restored)
    }

    /// Wait until every transition so far has been handed to the store
    pub async fn flush_store(&self) {
        if let Some(writer) = &self.writer {
            writer.flush().await;
        }
    }

    fn persist(&self, workflow: &Workflow) {
        if let Some(writer) = &self.writer {
            writer.save(StoredRecord::Workflow(workflow.clone()));
        }
    }

    async fn emit_all(&self, events: Vec<LifecycleEvent>) {
        for event in events {
            self.events.emit(event).await;
        }
    }

    /// Skip steps whose condition is false, collect launches for the rest of
    /// the ready frontier, and complete the workflow once every step has a
    /// result. Only acts on running workflows.
    fn advance(
        &self,
        state: &mut CoordinatorState,
        workflow_id: &str,
        events: &mut Vec<LifecycleEvent>,
    ) -> Vec<StepLaunch> {
        let mut launches = Vec::new();

        loop {
            let in_flight = state.in_flight(workflow_id);
            let Some(workflow) = state.workflows.get_mut(workflow_id) else {
                return launches;
            };
            if workflow.status != WorkflowStatus::Running {
                return launches;
            }

            let ready: Vec<WorkflowStep> = workflow
                .ready_frontier(&in_flight)
                .into_iter()
                .cloned()
                .collect();

            let mut skipped_any = false;
            let mut to_launch = Vec::new();
            for step in ready {
                let runs = step
                    .condition
                    .as_ref()
                    .is_none_or(|condition| condition.evaluate(&workflow.context));
                if runs {
                    to_launch.push(step);
                    continue;
                }

                debug!("Skipping step {}/{}: condition not met", workflow_id, step.id);
                workflow
                    .context
                    .step_results
                    .insert(step.id.clone(), Value::Null);
                workflow.context.skipped.push(step.id.clone());
                events.push(LifecycleEvent::StepSkipped {
                    workflow_id: workflow_id.to_string(),
                    step_id: step.id.clone(),
                    at: Utc::now(),
                });
                skipped_any = true;
            }

            for step in to_launch {
                if let Some(launch) = self.prepare_launch(state, workflow_id, &step) {
                    launches.push(launch);
                }
            }

            // Skipped results may unlock further steps
            if !skipped_any {
                break;
            }
        }

        self.complete_if_done(state, workflow_id, events);
        launches
    }

    fn complete_if_done(
        &self,
        state: &mut CoordinatorState,
        workflow_id: &str,
        events: &mut Vec<LifecycleEvent>,
    ) {
        let idle = state
            .in_flight
            .get(workflow_id)
            .is_none_or(|steps| steps.is_empty());
        let Some(workflow) = state.workflows.get_mut(workflow_id) else {
            return;
        };
        if workflow.status != WorkflowStatus::Running || !idle || !workflow.all_steps_done() {
            return;
        }

        let output = self.aggregator.aggregate(&workflow.context);
        workflow.context.output = Some(output.clone());
        workflow.status = WorkflowStatus::Completed;
        workflow.metadata.completed_at = Some(Utc::now());
        info!("Workflow {} completed", workflow_id);
        events.push(LifecycleEvent::WorkflowCompleted {
            workflow_id: workflow_id.to_string(),
            output,
            at: Utc::now(),
        });
        self.persist(workflow);
        state.tokens.remove(workflow_id);
        state.in_flight.remove(workflow_id);
    }

    /// Build the execution request for a step and mark it in flight
    fn prepare_launch(
        &self,
        state: &mut CoordinatorState,
        workflow_id: &str,
        step: &WorkflowStep,
    ) -> Option<StepLaunch> {
        let workflow = state.workflows.get(workflow_id)?;
        let run = *state.runs.get(workflow_id)?;
        let token = state.tokens.get(workflow_id)?.child_token();
        let executor = self.registry.get(&step.step_type)?;

        let mut input: Map<String, Value> = workflow.context.input.clone();
        for (name, value) in &workflow.context.variables {
            input.insert(name.clone(), value.clone());
        }
        let previous_results = step
            .dependencies
            .iter()
            .filter_map(|dep| {
                let result = workflow.context.step_results.get(dep)?;
                Some((dep.clone(), result.clone()))
            })
            .collect();

        let request = StepRequest {
            workflow_id: workflow_id.to_string(),
            step_id: step.id.clone(),
            step_type: step.step_type.clone(),
            attempt: workflow.error_count(&step.id) + 1,
            input,
            config: step.config.clone(),
            previous_results,
            cancel_token: token,
        };
        let timeout = step.timeout().or(self
            .config
            .default_step_timeout_ms
            .map(Duration::from_millis));

        state
            .in_flight
            .entry(workflow_id.to_string())
            .or_default()
            .insert(step.id.clone());

        Some(StepLaunch {
            executor,
            request,
            run,
            timeout,
        })
    }

    /// Run one attempt on its own task. A timeout cancels the attempt token
    /// and records the failure; the executor is left to wind down by itself.
    fn launch(&self, launch: StepLaunch) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let StepLaunch {
                executor,
                request,
                run,
                timeout,
            } = launch;
            debug!(
                "Executing step {}/{} (attempt {})",
                request.workflow_id, request.step_id, request.attempt
            );

            let attempt_request = request.clone();
            let mut handle =
                tokio::spawn(async move { executor.execute(&attempt_request).await });
            let joined = match timeout {
                Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                    Ok(joined) => Some(joined),
                    Err(_) => {
                        request.cancel_token.cancel();
                        None
                    }
                },
                None => Some(handle.await),
            };

            let outcome = match joined {
                Some(Ok(result)) => result.map_err(|e| format!("{:#}", e)),
                Some(Err(join_error)) => Err(format!("step executor panicked: {}", join_error)),
                None => Err(format!(
                    "step timed out after {}ms",
                    timeout.map(|t| t.as_millis()).unwrap_or_default()
                )),
            };

            coordinator
                .finish_step(&request.workflow_id, run, &request.step_id, outcome)
                .await;
        });
    }

    async fn finish_step(
        &self,
        workflow_id: &str,
        run: u64,
        step_id: &str,
        outcome: std::result::Result<Value, String>,
    ) {
        let mut events = Vec::new();
        let mut launches = Vec::new();
        let mut retry_after = None;
        {
            let mut state = self.state.lock().await;
            if !state.owns(workflow_id, run, step_id) {
                debug!(
                    "Discarding result of step {}/{} from a previous run",
                    workflow_id, step_id
                );
                return;
            }
            let Some(workflow) = state.workflows.get_mut(workflow_id) else {
                return;
            };
            if !workflow.is_active() {
                debug!(
                    "Ignoring result of step {}/{}: workflow is {:?}",
                    workflow_id, step_id, workflow.status
                );
                return;
            }

            match outcome {
                Ok(output) => {
                    workflow
                        .context
                        .step_results
                        .insert(step_id.to_string(), output.clone());
                    events.push(LifecycleEvent::StepCompleted {
                        workflow_id: workflow_id.to_string(),
                        step_id: step_id.to_string(),
                        output,
                        at: Utc::now(),
                    });
                    self.persist(workflow);
                    state.release(workflow_id, step_id);
                    launches = self.advance(&mut state, workflow_id, &mut events);
                }
                Err(error) => {
                    let attempt = workflow.error_count(step_id) + 1;
                    workflow.context.errors.push(StepError {
                        step_id: step_id.to_string(),
                        error: error.clone(),
                        timestamp: Utc::now(),
                        attempt,
                    });
                    events.push(LifecycleEvent::StepFailed {
                        workflow_id: workflow_id.to_string(),
                        step_id: step_id.to_string(),
                        error: error.clone(),
                        attempt,
                        at: Utc::now(),
                    });

                    let policy = workflow
                        .step(step_id)
                        .and_then(|step| step.retry_policy.clone());
                    match policy {
                        Some(policy) if policy.allows_retry(attempt) => {
                            let delay = policy.delay_for_attempt(attempt);
                            warn!(
                                "Step {}/{} failed (attempt {}), retrying in {:?}: {}",
                                workflow_id, step_id, attempt, delay, error
                            );
                            self.persist(workflow);
                            // Stays in flight so the frontier does not relaunch it
                            retry_after = Some(delay);
                        }
                        _ => {
                            workflow.status = WorkflowStatus::Failed;
                            workflow.metadata.completed_at = Some(Utc::now());
                            let message = format!(
                                "step {} failed after {} attempt(s): {}",
                                step_id, attempt, error
                            );
                            warn!("Workflow {} failed: {}", workflow_id, message);
                            events.push(LifecycleEvent::WorkflowFailed {
                                workflow_id: workflow_id.to_string(),
                                error: message,
                                at: Utc::now(),
                            });
                            self.persist(workflow);
                            state.tokens.remove(workflow_id);
                            state.in_flight.remove(workflow_id);
                        }
                    }
                }
            }
        }

        self.emit_all(events).await;
        for launch in launches {
            self.launch(launch);
        }
        if let Some(delay) = retry_after {
            let coordinator = self.clone();
            let (workflow_id, step_id) = (workflow_id.to_string(), step_id.to_string());
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                coordinator.retry_step(&workflow_id, run, &step_id).await;
            });
        }
    }

    async fn retry_step(&self, workflow_id: &str, run: u64, step_id: &str) {
        let launch = {
            let mut state = self.state.lock().await;
            if !state.owns(workflow_id, run, step_id) {
                debug!(
                    "Dropping retry of step {}/{} from a previous run",
                    workflow_id, step_id
                );
                return;
            }
            let Some(status) = state.workflows.get(workflow_id).map(|w| w.status) else {
                return;
            };
            match status {
                WorkflowStatus::Running => {}
                // Resume relaunches it with the rest of the frontier
                WorkflowStatus::Paused => {
                    state.release(workflow_id, step_id);
                    return;
                }
                _ => return,
            }
            let Some(step) = state
                .workflows
                .get(workflow_id)
                .and_then(|w| w.step(step_id).cloned())
            else {
                return;
            };
            self.prepare_launch(&mut state, workflow_id, &step)
        };

        if let Some(launch) = launch {
            self.launch(launch);
        }
    }
}
