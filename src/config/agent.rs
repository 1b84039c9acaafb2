//! Per-agent configuration files.

use crate::config::types::{ArenaEnv, ArenaError, Provider, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// One participant as described on disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    /// Template program, relative to `AGENT_SPACE` unless absolute.
    pub agent_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,
}

impl AgentConfig {
    /// Load a config file; relative paths are looked up in `AGENT_SPACE`.
    pub fn load(env: &ArenaEnv, file: &Path) -> Result<Self> {
        let path = env.in_agent_space(file);
        log::info!("Loading agent config from {}", path.display());
        let raw = fs::read_to_string(&path).map_err(|e| {
            ArenaError::Config(format!("cannot read agent config {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
            .map_err(|e| ArenaError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ArenaError::Config("agent name must not be empty".into()));
        }
        // Names end up in log file names.
        if self.name.contains('/') || self.name.contains('\0') {
            return Err(ArenaError::Config(format!(
                "agent name '{}' contains a path separator",
                self.name
            )));
        }
        if self.agent_path.as_os_str().is_empty() {
            return Err(ArenaError::Config(format!(
                "agent '{}' has an empty agent_path",
                self.name
            )));
        }
        if self.provider.is_some() && self.model.as_deref().map_or(true, str::is_empty) {
            log::warn!(
                "agent '{}' names a provider but no model; the backend default will be used",
                self.name
            );
        }
        Ok(())
    }

    /// Agents without a provider never call the move-generation service.
    pub fn uses_service(&self) -> bool {
        self.provider.is_some()
    }
}
