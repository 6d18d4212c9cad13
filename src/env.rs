//! Environment constants and path utilities for the dispatcher.
//!
//! Centralizes configuration file names, default tuning values and the reserved
//! `status_reason` codes recorded on tasks.

use std::path::{Path, PathBuf};

/// Application directory name (hidden directory like .git)
pub const APP_DIR_NAME: &str = ".cogloop";

/// Configuration file name inside the application directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name looked up in the current directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "cogloop.toml";

/// Default tuning values
pub mod defaults {
    pub const MAX_CONCURRENT_TASKS: u32 = 3;
    pub const MAX_RETRIES: u32 = 3;
    pub const EXECUTION_TIMEOUT_MS: u64 = 30_000;
    pub const BACKOFF_BASE_MS: u64 = 1_000;
    pub const BACKOFF_CAP_MS: u64 = 30_000;
    /// Upper bound for execution timeouts and backoff delays (one week)
    pub const MAX_DELAY_MS: u64 = 7 * 24 * 60 * 60 * 1000;
    pub const COMMAND_BUFFER: usize = 256;
    pub const LOG_FILTER: &str = "cogloop=info";
}

/// Reserved `status_reason` codes
pub mod reasons {
    pub const TIMEOUT: &str = "timeout";
    pub const RETRIES_EXHAUSTED: &str = "retries_exhausted";
    pub const CANCELLED: &str = "cancelled";
    pub const ACTIVATED: &str = "activated";
    pub const DISPATCHED: &str = "dispatched";
    pub const DEPENDENCIES_MET: &str = "dependencies_met";
    pub const AWAITING_CONDITION: &str = "awaiting_condition";
    pub const AWAITING_DEPENDENCIES: &str = "awaiting_dependencies";
    pub const DEPENDENCY_ADDED: &str = "dependency_added";
    pub const COMPLETED: &str = "completed";
}

/// Build the application directory path from a root
pub fn app_dir_path(root: &Path) -> PathBuf {
    root.join(APP_DIR_NAME)
}

/// `./.cogloop/config.toml` style path under a workspace root
pub fn local_config_file_path(root: &Path) -> PathBuf {
    app_dir_path(root).join(CONFIG_FILE_NAME)
}

/// `~/.cogloop/config.toml`
pub fn user_config_file_path(home: &Path) -> PathBuf {
    app_dir_path(home).join(CONFIG_FILE_NAME)
}
