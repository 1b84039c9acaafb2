//! Per-agent credentials shared between the controller and the service.

use crate::config::agent::AgentConfig;
use crate::config::types::{ArenaError, Provider, Result};
use crate::server::backend::default_model;
use log::{debug, info};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Credential key -> agent config, as written to the temporary credentials file.
pub type Credentials = BTreeMap<String, AgentConfig>;

pub fn new_api_key() -> String {
    format!("agent_key_{}", uuid::Uuid::new_v4().simple())
}

/// Write credentials readable by the owner only.
pub fn write_credentials(path: &Path, credentials: &Credentials) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(serde_json::to_string_pretty(credentials)?.as_bytes())?;
    file.sync_all()?;
    debug!("Wrote {} credentials to {}", credentials.len(), path.display());
    Ok(())
}

pub fn read_credentials(path: &Path) -> Result<Credentials> {
    let raw = fs::read_to_string(path).map_err(|e| {
        ArenaError::Config(format!("cannot read credentials {}: {}", path.display(), e))
    })?;
    Ok(serde_json::from_str(&raw)?)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisteredAgent {
    pub name: String,
    pub provider: Provider,
    pub model: String,
}

/// Agents allowed to call the service, keyed by credential.
#[derive(Clone, Debug, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, RegisteredAgent>,
}

impl AgentRegistry {
    /// Configs without a provider never call the service and are skipped.
    pub fn from_credentials(credentials: &Credentials) -> Self {
        let mut agents = HashMap::new();
        for (key, config) in credentials {
            let Some(provider) = config.provider else {
                debug!("Agent '{}' has no provider; not registered", config.name);
                continue;
            };
            let model = config
                .model
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| default_model(provider).to_string());
            agents.insert(
                key.clone(),
                RegisteredAgent {
                    name: config.name.clone(),
                    provider,
                    model,
                },
            );
        }
        info!("Registered {} agents with the move service", agents.len());
        Self { agents }
    }

    pub fn lookup(&self, api_key: &str) -> Option<&RegisteredAgent> {
        self.agents.get(api_key)
    }

    /// Credential keys taking part in the turn barrier.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    /// Providers some registered agent depends on.
    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self.agents.values().map(|a| a.provider).collect();
        providers.sort_by_key(|p| p.as_str());
        providers.dedup();
        providers
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
