//! Workflow definition files
//!
//! A workflow file is a serialized [`Workflow`]: `.json` files are parsed as
//! JSON, `.toml` files as TOML with one `[[steps]]` table per step.

use crate::workflow::Workflow;
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("File '{path}' is not UTF-8 encoded")]
    NotUtf8 { path: PathBuf },

    #[error("File '{path}' not found")]
    NotFound { path: PathBuf },

    #[error("IO error reading '{path}': {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Unsupported workflow format '{extension}' for '{path}' (expected .json or .toml)")]
    UnsupportedFormat { path: PathBuf, extension: String },

    #[error("Workflow parsing error in '{path}': {reason}")]
    ParseError { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowFormat {
    Json,
    Toml,
}

impl WorkflowFormat {
    /// Extension matching is case-insensitive
    pub fn detect(path: &Path) -> Result<Self, FileError> {
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_lowercase();

        match extension.as_str() {
            "json" => Ok(Self::Json),
            "toml" => Ok(Self::Toml),
            _ => Err(FileError::UnsupportedFormat {
                path: path.to_path_buf(),
                extension,
            }),
        }
    }
}

/// Loads workflow definitions from disk
pub struct WorkflowLoader;

impl WorkflowLoader {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Workflow, FileError> {
        let path = path.as_ref();
        let format = WorkflowFormat::detect(path)?;
        let content = Self::read_utf8(path)?;
        let mut workflow = Self::parse(&content, format).map_err(|reason| {
            FileError::ParseError {
                path: path.to_path_buf(),
                reason,
            }
        })?;

        if workflow.metadata.created_at.is_none() {
            workflow.metadata.created_at = Some(Utc::now());
        }
        debug!(
            "Loaded workflow '{}' with {} steps from {:?}",
            workflow.id,
            workflow.steps.len(),
            path
        );
        Ok(workflow)
    }

    pub fn load_all(paths: &[PathBuf]) -> Result<Vec<Workflow>, FileError> {
        paths.iter().map(Self::load).collect()
    }

    pub fn parse(content: &str, format: WorkflowFormat) -> Result<Workflow, String> {
        match format {
            WorkflowFormat::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
            WorkflowFormat::Toml => toml::from_str(content).map_err(|e| e.to_string()),
        }
    }

    fn read_utf8(path: &Path) -> Result<String, FileError> {
        fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FileError::NotFound {
                path: path.to_path_buf(),
            },
            std::io::ErrorKind::InvalidData => FileError::NotUtf8 {
                path: path.to_path_buf(),
            },
            _ => FileError::IoError {
                path: path.to_path_buf(),
                source: e,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{StepCondition, WorkflowStatus};
    use serde_json::json;
    use tempfile::TempDir;

    const TOML_WORKFLOW: &str = r#"
id = "nightly"
name = "Nightly report"

[context.input]
region = "eu"

[[steps]]
id = "fetch"
type = "echo"

[[steps]]
id = "report"
type = "echo"
dependencies = ["fetch"]
timeout_ms = 5000
config = { format = "csv" }
retry_policy = { max_attempts = 3, initial_delay_ms = 100, backoff_multiplier = 2.0, max_delay_ms = 1000 }
condition = { kind = "variable_exists", name = "enabled" }
"#;

    #[test]
    fn test_detect_format() {
        assert_eq!(
            WorkflowFormat::detect(Path::new("flow.json")).unwrap(),
            WorkflowFormat::Json
        );
        assert_eq!(
            WorkflowFormat::detect(Path::new("/a/b/flow.TOML")).unwrap(),
            WorkflowFormat::Toml
        );
        assert!(matches!(
            WorkflowFormat::detect(Path::new("flow.yaml")),
            Err(FileError::UnsupportedFormat { .. })
        ));
        assert!(WorkflowFormat::detect(Path::new("flow")).is_err());
    }

    #[test]
    fn test_parse_toml() {
        let workflow = WorkflowLoader::parse(TOML_WORKFLOW, WorkflowFormat::Toml).unwrap();
        assert_eq!(workflow.id, "nightly");
        assert_eq!(workflow.status, WorkflowStatus::Pending);
        assert_eq!(workflow.context.input["region"], json!("eu"));

        let report = workflow.step("report").unwrap();
        assert_eq!(report.dependencies, vec!["fetch".to_string()]);
        assert_eq!(report.config, json!({"format": "csv"}));
        assert_eq!(report.retry_policy.as_ref().unwrap().max_attempts, 3);
        assert_eq!(
            report.condition,
            Some(StepCondition::VariableExists {
                name: "enabled".to_string()
            })
        );
    }

    #[test]
    fn test_load_json_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flow.json");
        fs::write(
            &path,
            json!({
                "id": "wf",
                "steps": [
                    {"id": "a", "type": "echo"},
                    {"id": "b", "type": "delay", "dependencies": ["a"], "config": {"ms": 5}}
                ]
            })
            .to_string(),
        )
        .unwrap();

        let workflow = WorkflowLoader::load(&path).unwrap();
        assert_eq!(workflow.steps.len(), 2);
        assert!(workflow.metadata.created_at.is_some());
    }

    #[test]
    fn test_load_errors() {
        let dir = TempDir::new().unwrap();

        let missing = dir.path().join("missing.json");
        assert!(matches!(
            WorkflowLoader::load(&missing),
            Err(FileError::NotFound { .. })
        ));

        let broken = dir.path().join("broken.toml");
        fs::write(&broken, "id = \"x\"\n[[steps]]\nid = 3\n").unwrap();
        let err = WorkflowLoader::load(&broken).unwrap_err();
        assert!(matches!(err, FileError::ParseError { .. }));
        assert!(err.to_string().contains("broken.toml"));

        let binary = dir.path().join("binary.json");
        fs::write(&binary, [0xff, 0xfe, 0x00, 0x81]).unwrap();
        assert!(matches!(
            WorkflowLoader::load(&binary),
            Err(FileError::NotUtf8 { .. })
        ));
    }
}
