//! Command line argument parsing
//!
//! Subcommands:
//! - `run`: Execute one or more workflow files concurrently
//! - `validate`: Check workflow files without running them
//! - `show-config`: Show configuration discovery information
//! - `init-config`: Write a default user configuration file

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug)]
pub enum ExecutionMode {
    Run(RunConfig),
    Validate(Vec<PathBuf>),
    ShowConfig,
    InitConfig,
}

#[derive(Debug)]
pub struct RunConfig {
    pub files: Vec<PathBuf>,
    /// Print each workflow's output as JSON once it finishes
    pub print_output: bool,
}

#[derive(Debug, Parser)]
#[command(name = "taskflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Task scheduling and DAG workflow orchestration engine")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    /// Configuration file path (skips discovery)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run workflow files (.json or .toml)
    Run {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Only report status, not workflow output
        #[arg(short = 'q', long = "quiet")]
        quiet: bool,
    },
    /// Validate workflow files without executing them
    Validate {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Show configuration discovery information
    ShowConfig,
    /// Create ~/.taskflow/config.toml with default values
    InitConfig,
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Run { files, quiet }) => Ok(ExecutionMode::Run(RunConfig {
                files: files.clone(),
                print_output: !*quiet,
            })),
            Some(Commands::Validate { files }) => Ok(ExecutionMode::Validate(files.clone())),
            Some(Commands::ShowConfig) => Ok(ExecutionMode::ShowConfig),
            Some(Commands::InitConfig) => Ok(ExecutionMode::InitConfig),
            None => Err(
                "No command specified. Use 'taskflow --help' to see available commands."
                    .to_string(),
            ),
        }
    }
}
