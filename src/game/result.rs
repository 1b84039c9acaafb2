//! The authoritative per-game outcome.

use crate::config::types::{ArenaError, EndReason, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub id: u32,
    pub name: String,
    pub was_killed: bool,
    /// Root pid; `null` when the agent never started.
    pub pid: Option<u32>,
    #[serde(default)]
    pub is_tripwire: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GameResult {
    pub agents: Vec<AgentOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
    #[serde(default)]
    pub duration_secs: f64,
}

impl GameResult {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            ArenaError::Analysis(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| ArenaError::Analysis(format!("{}: {}", path.display(), e)))
    }

    pub fn agent(&self, id: u32) -> Option<&AgentOutcome> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub fn survivors(&self) -> impl Iterator<Item = &AgentOutcome> {
        self.agents.iter().filter(|a| !a.was_killed && !a.is_tripwire)
    }
}

/// Writes the result file at most once.
#[derive(Debug)]
pub struct ResultWriter {
    path: PathBuf,
    written: bool,
}

impl ResultWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            written: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_written(&self) -> bool {
        self.written
    }

    /// Persist with flush and fsync. Returns `false` without touching the file
    /// when a result was already written through this writer.
    pub fn write(&mut self, result: &GameResult) -> Result<bool> {
        if self.written {
            warn!("Game result already written to {}", self.path.display());
            return Ok(false);
        }
        let json = serde_json::to_string_pretty(result)?;
        let mut file = File::create(&self.path)?;
        file.write_all(json.as_bytes())?;
        file.flush()?;
        file.sync_all()?;
        if let Some(dir) = self.path.parent() {
            if let Ok(dir) = File::open(dir) {
                let _ = dir.sync_all();
            }
        }
        self.written = true;
        info!("Game result written to {}", self.path.display());
        Ok(true)
    }
}
