//! Command line argument parsing
//!
//! Subcommands:
//! - `run`: Run a file of submission messages through the dispatcher with an echo runner
//! - `validate`: Check a submission file without executing anything
//! - `show-config`: Show configuration discovery information

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug)]
pub enum ExecutionMode {
    Run(RunConfig),
    Validate(ValidateConfig),
    ShowConfig { defaults: bool },
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub submissions: PathBuf,
    pub config_override: Option<PathBuf>,
    pub max_concurrent: Option<u32>,
    pub runner_delay_ms: u64,
    /// Memory topics reported as completed once everything is submitted
    pub memory_topics: Vec<String>,
    pub timeout_secs: u64,
    pub json: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone)]
pub struct ValidateConfig {
    pub submissions: PathBuf,
    pub config_override: Option<PathBuf>,
    pub verbose: bool,
}

#[derive(Debug, Parser)]
#[command(name = "cogloop")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Priority task dispatcher for cognitive-loop agents")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Simulate a submission file (JSON object or array) with an echo runner
    Run {
        /// Path to the submission file
        file: PathBuf,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Override scheduler.max_concurrent_tasks
        #[arg(short = 'j', long = "max-concurrent")]
        max_concurrent: Option<u32>,
        /// Artificial runner latency in milliseconds
        #[arg(long = "runner-delay-ms", default_value_t = 0)]
        runner_delay_ms: u64,
        /// Memory topic to mark completed after submission (repeatable)
        #[arg(short = 'm', long = "memory", value_name = "TOPIC")]
        memory_topics: Vec<String>,
        /// Give up after this many seconds
        #[arg(long = "timeout", default_value_t = 60)]
        timeout_secs: u64,
        /// Print events as JSON lines
        #[arg(long = "json")]
        json: bool,
        /// Enable verbose output
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
    },
    /// Validate a submission file
    Validate {
        /// Path to the submission file
        file: PathBuf,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Enable verbose output
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
    },
    /// Show configuration discovery information
    ShowConfig {
        /// Print the built-in default configuration as TOML
        #[arg(long = "defaults")]
        defaults: bool,
    },
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Run {
                file,
                config,
                max_concurrent,
                runner_delay_ms,
                memory_topics,
                timeout_secs,
                json,
                verbose,
            }) => {
                if *max_concurrent == Some(0) {
                    return Err("--max-concurrent must be at least 1".to_string());
                }
                Ok(ExecutionMode::Run(RunConfig {
                    submissions: file.clone(),
                    config_override: config.clone(),
                    max_concurrent: *max_concurrent,
                    runner_delay_ms: *runner_delay_ms,
                    memory_topics: memory_topics.clone(),
                    timeout_secs: *timeout_secs,
                    json: *json,
                    verbose: *verbose,
                }))
            }
            Some(Commands::Validate {
                file,
                config,
                verbose,
            }) => Ok(ExecutionMode::Validate(ValidateConfig {
                submissions: file.clone(),
                config_override: config.clone(),
                verbose: *verbose,
            })),
            Some(Commands::ShowConfig { defaults }) => Ok(ExecutionMode::ShowConfig {
                defaults: *defaults,
            }),
            None => Err(
                "No command specified. Use 'cogloop --help' to see available commands.".to_string(),
            ),
        }
    }
}

impl ExecutionMode {
    pub fn verbose(&self) -> bool {
        match self {
            ExecutionMode::Run(config) => config.verbose,
            ExecutionMode::Validate(config) => config.verbose,
            ExecutionMode::ShowConfig { .. } => false,
        }
    }

    pub fn config_override(&self) -> Option<&std::path::Path> {
        match self {
            ExecutionMode::Run(config) => config.config_override.as_deref(),
            ExecutionMode::Validate(config) => config.config_override.as_deref(),
            ExecutionMode::ShowConfig { .. } => None,
        }
    }
}
