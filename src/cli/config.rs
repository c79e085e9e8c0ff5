//! Engine configuration file and its lookup.
//!
//! Lookup order: `./taskflow.toml`, `./.taskflow/config.toml`,
//! `~/.taskflow/config.toml`, `/etc/taskflow/config.toml` (unix only), then
//! built-in defaults. The first file found wins; files are not merged.

use crate::{
    env, storage::StorageConfig, task::TaskManagerConfig, workflow::CoordinatorConfig,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env as std_env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Complete engine configuration. Every section falls back to its defaults,
/// so a partial file is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub task_manager: TaskManagerConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive; the `TASKFLOW_LOG`
    /// environment variable takes precedence
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    env::DEFAULT_LOG_FILTER.to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl EngineConfig {
    /// Load from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: EngineConfig = toml::from_str(&content)
            .with_context(|| format!("Invalid config file {:?}", path))?;
        Ok(config)
    }

    /// Save to TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file {:?}", path.as_ref()))?;
        Ok(())
    }
}

/// Where a configuration candidate comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    /// `./taskflow.toml`
    WorkingFile,
    /// `./.taskflow/config.toml`
    WorkingDir,
    /// `~/.taskflow/config.toml`
    User,
    /// `/etc/taskflow/config.toml`
    System,
}

impl ConfigSource {
    pub fn label(&self) -> &'static str {
        match self {
            ConfigSource::WorkingFile => "working directory file",
            ConfigSource::WorkingDir => "working directory .taskflow",
            ConfigSource::User => "user",
            ConfigSource::System => "system",
        }
    }
}

/// Resolves the engine configuration from the first existing candidate,
/// falling back to built-in defaults.
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Load the first candidate found, or the built-in defaults. Also returns
    /// the file that was used so callers can report it once logging is up.
    pub fn discover_config() -> Result<(EngineConfig, Option<PathBuf>)> {
        match Self::find_config_file() {
            Some(path) => Ok((EngineConfig::from_toml_file(&path)?, Some(path))),
            None => Ok((EngineConfig::default(), None)),
        }
    }

    /// First candidate that is a regular file
    pub fn find_config_file() -> Option<PathBuf> {
        Self::get_config_candidates()
            .into_iter()
            .map(|(_, path)| path)
            .find(|path| path.is_file())
    }

    /// Candidates in lookup order, highest precedence first
    fn get_config_candidates() -> Vec<(ConfigSource, PathBuf)> {
        let mut candidates = Vec::with_capacity(4);

        if let Ok(cwd) = std_env::current_dir() {
            candidates.push((
                ConfigSource::WorkingFile,
                cwd.join(env::LOCAL_CONFIG_FILE_NAME),
            ));
            candidates.push((ConfigSource::WorkingDir, env::local_config_file_path(&cwd)));
        }
        if let Some(home) = Self::get_home_dir() {
            candidates.push((ConfigSource::User, env::user_config_file_path(&home)));
        }
        if cfg!(unix) {
            candidates.push((ConfigSource::System, PathBuf::from(env::SYSTEM_CONFIG_FILE)));
        }

        candidates
    }

    fn get_home_dir() -> Option<PathBuf> {
        ["HOME", "USERPROFILE"]
            .iter()
            .find_map(|var| std_env::var_os(var))
            .map(PathBuf::from)
    }

    /// Write the defaults to `~/.taskflow/config.toml` unless a file is
    /// already there. Returns the path either way.
    pub fn create_default_user_config() -> Result<PathBuf> {
        let home = Self::get_home_dir().context("Neither HOME nor USERPROFILE is set")?;
        let path = env::user_config_file_path(&home);

        if path.exists() {
            warn!("Keeping existing configuration at {}", path.display());
            return Ok(path);
        }

        fs::create_dir_all(env::user_config_dir_path(&home))?;
        EngineConfig::default().to_toml_file(&path)?;
        info!("Wrote default configuration to {}", path.display());
        Ok(path)
    }

    /// Print every candidate with its state and the one in effect
    pub fn show_discovery_info() {
        let candidates = Self::get_config_candidates();
        let active = candidates.iter().find(|(_, path)| path.is_file());

        println!("Configuration lookup order:");
        for (source, path) in &candidates {
            let state = match (path.is_file(), path.exists()) {
                (true, _) => "found",
                (false, true) => "present but not a file",
                (false, false) => "missing",
            };
            println!("  {:<28} {} ({})", source.label(), path.display(), state);
        }
        match active {
            Some((source, path)) => {
                println!("In effect: {} [{}]", path.display(), source.label())
            }
            None => println!("In effect: built-in defaults"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.task_manager.max_concurrent_tasks, 3);
        assert_eq!(config.coordinator.max_active_workflows, 10);
        assert_eq!(config.logging.filter, "taskflow=info");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [task_manager]
            max_concurrent_tasks = 8
            default_priority = 2

            [storage]
            backend = "file"
            path = "/var/lib/taskflow"
            "#,
        )
        .unwrap();

        assert_eq!(config.task_manager.max_concurrent_tasks, 8);
        assert_eq!(config.task_manager.default_max_attempts, 3);
        assert_eq!(
            config.task_manager.default_priority,
            crate::task::TaskPriority::High
        );
        assert_eq!(config.storage.resolved_path(), Path::new("/var/lib/taskflow"));
        assert_eq!(config.coordinator.max_active_workflows, 10);
    }

    #[test]
    fn test_toml_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.toml");

        let mut original = EngineConfig::default();
        original.coordinator.default_step_timeout_ms = Some(2500);
        original.to_toml_file(&path).unwrap();

        let loaded = EngineConfig::from_toml_file(&path).unwrap();
        assert_eq!(loaded.coordinator.default_step_timeout_ms, Some(2500));
        assert_eq!(
            loaded.task_manager.resource_backoff_ms,
            original.task_manager.resource_backoff_ms
        );
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = EngineConfig::from_toml_file("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_candidate_order() {
        let sources: Vec<ConfigSource> = ConfigDiscovery::get_config_candidates()
            .into_iter()
            .map(|(source, _)| source)
            .collect();
        assert_eq!(sources[0], ConfigSource::WorkingFile);
        assert_eq!(sources[1], ConfigSource::WorkingDir);
        #[cfg(unix)]
        assert_eq!(sources.last(), Some(&ConfigSource::System));
    }
}
