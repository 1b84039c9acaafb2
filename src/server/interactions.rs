//! Append-only record of every generation request and its answer.

use crate::config::types::Result;
use crate::server::backend::Message;
use chrono::Utc;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interaction {
    pub timestamp: String,
    pub agent_name: String,
    pub api_key: String,
    pub messages: Vec<Message>,
    pub response: Option<String>,
}

/// JSON-lines interaction log. A missing file disables logging.
pub struct InteractionLog {
    path: Option<PathBuf>,
    file: Option<Mutex<File>>,
}

impl InteractionLog {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            file: Some(Mutex::new(file)),
        })
    }

    pub fn disabled() -> Self {
        Self {
            path: None,
            file: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record(&self, agent_name: &str, api_key: &str, messages: &[Message], response: Option<&str>) {
        let Some(file) = &self.file else {
            return;
        };
        let entry = Interaction {
            timestamp: Utc::now().to_rfc3339(),
            agent_name: agent_name.to_string(),
            api_key: api_key.to_string(),
            messages: messages.to_vec(),
            response: response.map(String::from),
        };
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize interaction: {}", e);
                return;
            }
        };
        let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(file, "{}", line).and_then(|_| file.flush()) {
            warn!("Failed to write interaction log: {}", e);
        }
    }
}

/// Read an interaction log back, skipping lines that do not parse.
pub fn read_interactions(path: &Path) -> Result<Vec<Interaction>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(raw
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_one_line_per_interaction() {
        let path = std::env::temp_dir().join(format!("arenabox-llm-{}.jsonl", uuid::Uuid::new_v4()));
        let log = InteractionLog::open(&path).unwrap();
        let messages = vec![Message::new("user", "go")];
        log.record("alpha", "k1", &messages, Some("print(1)"));
        log.record("beta", "k2", &messages, None);

        let entries = read_interactions(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].agent_name, "alpha");
        assert_eq!(entries[0].response.as_deref(), Some("print(1)"));
        assert_eq!(entries[1].response, None);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn disabled_log_is_silent() {
        let log = InteractionLog::disabled();
        log.record("a", "k", &[], None);
        assert!(log.path().is_none());
    }
}
