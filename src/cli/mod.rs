//! CLI-specific functionality
//!
//! Argument parsing, configuration discovery, submission file loading and the offline
//! simulation driver.

pub mod args;
pub mod config;
pub mod simulate;
pub mod tasks;

pub use args::{Args, ExecutionMode, RunConfig, ValidateConfig};
pub use config::ConfigDiscovery;
pub use simulate::{Simulation, SimulationReport, ValidationReport, describe_event, validate_submissions};
pub use tasks::{FileError, SubmissionLoader};
