use crate::dispatch::DispatcherConfig;
use crate::env::defaults;
use crate::task::SchedulerConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level engine configuration, loaded from TOML
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// `tracing` filter used when `RUST_LOG` is not set
    pub log_filter: String,
    pub scheduler: SchedulerConfig,
    pub dispatcher: DispatcherConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_filter: defaults::LOG_FILTER.to_string(),
            scheduler: SchedulerConfig::default(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_toml_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_toml_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml_string()?;
        std::fs::write(path, content).context("Failed to write config file")
    }

    /// Convert configuration to a TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler
            .validate()
            .context("Invalid [scheduler] configuration")?;
        if self.dispatcher.command_buffer == 0 {
            anyhow::bail!("dispatcher.command_buffer must be at least 1");
        }
        Ok(())
    }
}
