use anyhow::{Context, Result, bail};
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use taskflow::cli::{Args, ConfigDiscovery, EngineConfig, ExecutionMode, RunConfig, WorkflowLoader};
use taskflow::{
    EventBus, ExecutorRegistry, LoggingEventHandler, StepRegistry, TaskManager,
    WorkflowCoordinator, WorkflowStatus, env, storage::store_from_config,
    workflow::validate_workflow,
};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let (config, config_path) = load_config(args.config.as_ref())?;
    init_logging(&config, args.verbose);
    match &config_path {
        Some(path) => info!("Using configuration {}", path.display()),
        None => debug!("No configuration file found, using built-in defaults"),
    }

    match mode {
        ExecutionMode::Run(run) => run_workflows(config, run).await,
        ExecutionMode::Validate(files) => validate_files(&config, &files),
        ExecutionMode::ShowConfig => {
            ConfigDiscovery::show_discovery_info();
            println!();
            println!("Effective configuration:");
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        ExecutionMode::InitConfig => {
            let path = ConfigDiscovery::create_default_user_config()?;
            println!("Configuration file: {}", path.display());
            Ok(())
        }
    }
}

fn load_config(config_override: Option<&PathBuf>) -> Result<(EngineConfig, Option<PathBuf>)> {
    match config_override {
        Some(path) => Ok((EngineConfig::from_toml_file(path)?, Some(path.clone()))),
        None => ConfigDiscovery::discover_config(),
    }
}

/// Built-in step types plus `task`, which runs on a manager configured by
/// the `[task_manager]` section
fn step_registry(config: &EngineConfig, events: Arc<EventBus>) -> StepRegistry {
    let manager = TaskManager::new(config.task_manager.clone(), ExecutorRegistry::with_builtins())
        .with_event_bus(events);
    StepRegistry::with_builtins().with_task_step(manager)
}

/// `TASKFLOW_LOG` wins over the config file; `--verbose` raises the crate to debug.
fn init_logging(config: &EngineConfig, verbose: bool) {
    let filter = EnvFilter::try_from_env(env::LOG_ENV_VAR).unwrap_or_else(|_| {
        let directive = if verbose {
            "taskflow=debug"
        } else {
            config.logging.filter.as_str()
        };
        EnvFilter::new(directive)
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_workflows(config: EngineConfig, run: RunConfig) -> Result<()> {
    let workflows = WorkflowLoader::load_all(&run.files)?;

    let events = Arc::new(EventBus::new());
    events.add_handler(Arc::new(LoggingEventHandler)).await;

    let registry = step_registry(&config, events.clone());
    let mut coordinator =
        WorkflowCoordinator::new(config.coordinator.clone(), registry).with_event_bus(events);
    if let Some(store) = store_from_config(&config.storage)? {
        coordinator = coordinator.with_store(store);
        let restored = coordinator.restore().await?;
        if restored > 0 {
            info!("Resumed {} workflow(s) from storage", restored);
        }
    }

    let mut ids = Vec::with_capacity(workflows.len());
    for workflow in workflows {
        let id = workflow.id.clone();
        let restored_status = coordinator
            .get_workflow(&id)
            .await
            .filter(|w| w.is_active())
            .map(|w| w.status);
        if restored_status == Some(WorkflowStatus::Paused) {
            coordinator.resume_workflow(&id).await?;
            info!("Workflow {} resumed from storage", id);
        } else if restored_status.is_some() {
            info!("Workflow {} already running from storage", id);
        } else {
            coordinator
                .start_workflow(workflow)
                .await
                .with_context(|| format!("Failed to start workflow {}", id))?;
        }
        ids.push(id);
    }

    let results = join_all(ids.iter().map(|id| coordinator.wait_for_workflow(id))).await;
    coordinator.flush_store().await;

    let mut failed = 0;
    for (id, result) in ids.iter().zip(results) {
        let workflow = result?;
        match workflow.status {
            WorkflowStatus::Completed => {
                println!("{}: completed", id);
                if run.print_output {
                    let output = workflow.context.output.unwrap_or_default();
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
            }
            status => {
                failed += 1;
                let last_error = workflow
                    .context
                    .errors
                    .last()
                    .map(|e| format!("{}: {}", e.step_id, e.error))
                    .unwrap_or_default();
                error!("Workflow {} ended as {:?} {}", id, status, last_error);
                println!("{}: {:?}", id, status);
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} workflow(s) did not complete", failed, ids.len());
    }
    Ok(())
}

fn validate_files(config: &EngineConfig, files: &[PathBuf]) -> Result<()> {
    let registry = step_registry(config, Arc::new(EventBus::new()));
    let mut invalid = 0;

    for path in files {
        let outcome = WorkflowLoader::load(path)
            .map_err(anyhow::Error::from)
            .and_then(|workflow| validate_workflow(&workflow, &registry).map_err(Into::into));
        match outcome {
            Ok(()) => println!("{}: ok", path.display()),
            Err(e) => {
                invalid += 1;
                println!("{}: {}", path.display(), e);
            }
        }
    }

    if invalid > 0 {
        bail!("{} invalid workflow file(s)", invalid);
    }
    Ok(())
}
