//! Environment constants and path utilities.
//!
//! Centralizes the directory names, file names and environment variables
//! used by configuration discovery, the file store and logging.

use std::path::{Path, PathBuf};

/// Per-project and per-user directory holding config and state
pub const TASKFLOW_DIR_NAME: &str = ".taskflow";

/// Configuration file name inside a `.taskflow` directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Stand-alone configuration file name in the current directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "taskflow.toml";

/// Unix system-wide configuration file
pub const SYSTEM_CONFIG_FILE: &str = "/etc/taskflow/config.toml";

/// Default directory for the JSON file store, inside `.taskflow`
pub const STATE_DIR_NAME: &str = "state";

/// Environment variable holding a tracing filter directive
pub const LOG_ENV_VAR: &str = "TASKFLOW_LOG";

/// Filter used when neither the environment nor the config sets one
pub const DEFAULT_LOG_FILTER: &str = "taskflow=info";

/// Build the `.taskflow` directory path from a workspace root
pub fn taskflow_dir_path(workspace_root: &Path) -> PathBuf {
    workspace_root.join(TASKFLOW_DIR_NAME)
}

/// Build the default file store directory from a workspace root
pub fn state_dir_path(workspace_root: &Path) -> PathBuf {
    taskflow_dir_path(workspace_root).join(STATE_DIR_NAME)
}

/// `~/.taskflow`
pub fn user_config_dir_path(home_dir: &Path) -> PathBuf {
    home_dir.join(TASKFLOW_DIR_NAME)
}

/// `~/.taskflow/config.toml`
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    user_config_dir_path(home_dir).join(CONFIG_FILE_NAME)
}

/// `<dir>/.taskflow/config.toml`
pub fn local_config_file_path(current_dir: &Path) -> PathBuf {
    taskflow_dir_path(current_dir).join(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_paths() {
        let home_dir = Path::new("/home/ops");
        let current_dir = Path::new("/srv/pipelines");

        assert_eq!(
            user_config_file_path(home_dir),
            Path::new("/home/ops/.taskflow/config.toml")
        );
        assert_eq!(
            local_config_file_path(current_dir),
            Path::new("/srv/pipelines/.taskflow/config.toml")
        );
        assert_eq!(
            state_dir_path(current_dir),
            Path::new("/srv/pipelines/.taskflow/state")
        );
    }
}
