//! End-to-end tests driving the task manager and the workflow coordinator
//! through the public API, sharing one event bus and a file-backed store.

use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskflow::storage::StoredRecord;
use taskflow::{
    CoordinatorConfig, EventBus, ExecutorRegistry, FnEventHandler, JsonFileStore, LifecycleEvent,
    StateStore, StepRegistry, Task, TaskDependency, TaskManager, TaskManagerConfig, TaskOptions,
    TaskStatus, Workflow, WorkflowCoordinator, WorkflowStatus, WorkflowStep,
};
use tempfile::TempDir;

fn manager_config() -> TaskManagerConfig {
    TaskManagerConfig {
        resource_check_enabled: false,
        ..Default::default()
    }
}

fn recording_bus() -> (Arc<EventBus>, Arc<Mutex<Vec<String>>>) {
    let bus = Arc::new(EventBus::new());
    let names = Arc::new(Mutex::new(Vec::new()));
    (bus, names)
}

async fn record_names(bus: &EventBus, names: Arc<Mutex<Vec<String>>>) {
    bus.add_handler(Arc::new(FnEventHandler(
        move |event: &LifecycleEvent| -> anyhow::Result<()> {
            names.lock().unwrap().push(event.name().to_string());
            Ok(())
        },
    )))
    .await;
}

#[tokio::test]
async fn test_workflow_step_delegates_to_task_manager() {
    let (bus, names) = recording_bus();
    record_names(&bus, names.clone()).await;

    let mut executors = ExecutorRegistry::new();
    executors.register_fn("square", |task: Task, _ctx| async move {
        let n = task.input["n"].as_i64().unwrap_or_default();
        Ok(json!(n * n))
    });
    let manager = TaskManager::new(manager_config(), executors).with_event_bus(bus.clone());

    let mut steps = StepRegistry::with_builtins();
    let step_manager = manager.clone();
    steps.register_fn("square_task", move |request| {
        let manager = step_manager.clone();
        async move {
            let n = request.config["n"].clone();
            let task = manager
                .submit_task("square", json!({ "n": n }), TaskOptions::default())
                .await?;
            let done = manager.wait_for_task(&task.id).await?;
            anyhow::ensure!(done.status == TaskStatus::Completed, "task {} failed", task.id);
            Ok::<_, anyhow::Error>(done.output.unwrap_or(Value::Null))
        }
    });

    let coordinator =
        WorkflowCoordinator::new(CoordinatorConfig::default(), steps).with_event_bus(bus.clone());

    let workflow = Workflow::new(
        "squares",
        vec![
            WorkflowStep::new("three", "square_task").with_config(json!({"n": 3})),
            WorkflowStep::new("four", "square_task").with_config(json!({"n": 4})),
            WorkflowStep::new("report", "echo")
                .depends_on("three")
                .depends_on("four"),
        ],
    );
    coordinator.start_workflow(workflow).await.unwrap();
    let finished = coordinator.wait_for_workflow("squares").await.unwrap();

    assert_eq!(finished.status, WorkflowStatus::Completed);
    let output = finished.context.output.unwrap();
    assert_eq!(output["three"], json!(9));
    assert_eq!(output["four"], json!(16));
    assert_eq!(output["report"]["previousResults"]["four"], json!(16));

    let stats = manager.task_stats().await;
    assert_eq!(stats.total, 2);
    assert_eq!(stats.by_status.get("completed"), Some(&2));

    // Handlers run on the emitting task, which may still be finishing up
    let seen = |name: &str| names.lock().unwrap().iter().filter(|n| *n == name).count();
    for _ in 0..100 {
        if seen("task_completed") == 2 && seen("workflow_completed") == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(seen("task_completed"), 2);
    assert_eq!(seen("workflow_completed"), 1);
    assert_eq!(
        names.lock().unwrap().first().map(String::as_str),
        Some("workflow_started")
    );
}

#[tokio::test]
async fn test_task_state_survives_restart_with_file_store() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn StateStore> = Arc::new(JsonFileStore::new(dir.path()).unwrap());

    // First process: the dependency finishes and is persisted
    {
        let mut executors = ExecutorRegistry::new();
        executors.register_fn("seed", |_task, _ctx| async { Ok(json!("seeded")) });
        let manager =
            TaskManager::new(manager_config(), executors).with_store(store.clone());

        let seed = manager
            .submit_task("seed", json!({}), TaskOptions::default().with_id("seed"))
            .await
            .unwrap();
        manager.wait_for_task(&seed.id).await.unwrap();
        manager.flush_store().await;
    }

    let pending = Task::new("grow", json!({}))
        .with_id("grow")
        .with_dependency(TaskDependency::hard("seed"));
    store.save(&StoredRecord::Task(pending)).await.unwrap();

    // Second process: restore, then the pending task runs against the
    // restored output of its dependency.
    let mut executors = ExecutorRegistry::new();
    executors.register_fn("seed", |_task, _ctx| async { Ok(json!("seeded")) });
    executors.register_fn("grow", |_task, ctx| async move {
        Ok(json!({ "from": ctx.dependency_outputs.get("seed").cloned() }))
    });
    let manager = TaskManager::new(manager_config(), executors).with_store(store.clone());
    assert_eq!(manager.restore().await.unwrap(), 2);

    let grown = manager.wait_for_task("grow").await.unwrap();
    assert_eq!(grown.status, TaskStatus::Completed);
    assert_eq!(grown.output, Some(json!({ "from": "seeded" })));

    manager.flush_store().await;
    let reloaded = store
        .load(taskflow::storage::RecordKind::Task, "grow")
        .await
        .unwrap();
    assert!(matches!(
        reloaded,
        Some(StoredRecord::Task(task)) if task.status == TaskStatus::Completed
    ));
}

#[tokio::test]
async fn test_workflow_resumes_from_file_store() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn StateStore> = Arc::new(JsonFileStore::new(dir.path()).unwrap());

    let runs = Arc::new(Mutex::new(Vec::new()));
    let registry = {
        let runs = runs.clone();
        let mut registry = StepRegistry::new();
        registry.register_fn("track", move |request| {
            let runs = runs.clone();
            async move {
                runs.lock().unwrap().push(request.step_id.clone());
                Ok(json!(request.step_id))
            }
        });
        registry
    };

    // A workflow interrupted after its first step
    let mut interrupted = Workflow::new(
        "resumable",
        vec![
            WorkflowStep::new("first", "track"),
            WorkflowStep::new("second", "track").depends_on("first"),
        ],
    );
    interrupted.status = WorkflowStatus::Running;
    interrupted
        .context
        .step_results
        .insert("first".to_string(), json!("first"));
    store
        .save(&StoredRecord::Workflow(interrupted))
        .await
        .unwrap();

    let coordinator = WorkflowCoordinator::new(CoordinatorConfig::default(), registry)
        .with_store(store.clone());
    assert_eq!(coordinator.restore().await.unwrap(), 1);

    let finished = tokio::time::timeout(
        Duration::from_secs(5),
        coordinator.wait_for_workflow("resumable"),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(runs.lock().unwrap().clone(), vec!["second".to_string()]);

    coordinator.flush_store().await;
    let persisted = store
        .load(taskflow::storage::RecordKind::Workflow, "resumable")
        .await
        .unwrap();
    assert!(matches!(
        persisted,
        Some(StoredRecord::Workflow(workflow)) if workflow.status == WorkflowStatus::Completed
    ));
}

#[tokio::test]
async fn test_events_are_serializable_for_external_sinks() {
    let bus = EventBus::new();
    let mut receiver = bus.subscribe();
    let coordinator = WorkflowCoordinator::new(
        CoordinatorConfig::default(),
        StepRegistry::with_builtins(),
    )
    .with_event_bus(Arc::new(bus));

    coordinator
        .start_workflow(Workflow::new("wire", vec![WorkflowStep::new("only", "echo")]))
        .await
        .unwrap();
    coordinator.wait_for_workflow("wire").await.unwrap();

    let first = receiver.recv().await.unwrap();
    let wire = serde_json::to_value(&first).unwrap();
    assert_eq!(wire["event"], json!("workflow_started"));
    assert_eq!(wire["workflow_id"], json!("wire"));
}
