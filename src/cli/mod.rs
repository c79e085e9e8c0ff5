//! CLI-specific functionality for the taskflow binary
//!
//! This module contains argument parsing, workflow file loading,
//! and configuration discovery.

pub mod args;
pub mod config;
pub mod workflows;

pub use args::{Args, ExecutionMode, RunConfig};
pub use config::{ConfigDiscovery, ConfigSource, EngineConfig, LoggingConfig};
pub use workflows::{FileError, WorkflowFormat, WorkflowLoader};
