/// Game audit trail
///
/// Structured, append-only JSON lines describing the lifecycle of a game:
/// start, agent spawns and deaths, degraded probes, the end of the game and
/// cleanup. Every line carries the game id so runs sharing a log directory
/// can be told apart.
use crate::config::types::{ArenaError, EndReason, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditSeverity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameEventType {
    GameStart,
    GameEnd,
    AgentSpawned,
    AgentSpawnFailed,
    AgentDied,
    ServiceStarted,
    ServiceFailed,
    ProbeDegraded,
    CleanupSuccess,
    CleanupFailure,
}

impl GameEventType {
    pub fn default_severity(&self) -> AuditSeverity {
        match self {
            Self::GameStart | Self::GameEnd | Self::AgentSpawned | Self::ServiceStarted => {
                AuditSeverity::Low
            }
            Self::AgentDied | Self::CleanupSuccess => AuditSeverity::Low,
            Self::ProbeDegraded => AuditSeverity::Medium,
            Self::AgentSpawnFailed | Self::ServiceFailed => AuditSeverity::High,
            Self::CleanupFailure => AuditSeverity::Critical,
        }
    }
}

/// Identifiers tying an event to a game and, optionally, an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameIds {
    pub game_id: String,
    pub agent_id: Option<u32>,
    pub agent_name: Option<String>,
    pub pid: Option<u32>,
}

impl GameIds {
    pub fn new(game_id: impl Into<String>) -> Self {
        Self {
            game_id: game_id.into(),
            agent_id: None,
            agent_name: None,
            pid: None,
        }
    }

    pub fn with_agent(mut self, id: u32, name: impl Into<String>) -> Self {
        self.agent_id = Some(id);
        self.agent_name = Some(name.into());
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameEvent {
    pub event_type: GameEventType,
    pub severity: AuditSeverity,
    pub timestamp: SystemTime,
    pub details: String,
    pub ids: Option<GameIds>,
}

impl GameEvent {
    pub fn new(event_type: GameEventType, details: String) -> Self {
        Self {
            severity: event_type.default_severity(),
            event_type,
            timestamp: SystemTime::now(),
            details,
            ids: None,
        }
    }

    pub fn with_ids(mut self, ids: GameIds) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn with_severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }

    fn to_json(&self) -> serde_json::Value {
        let mut entry = serde_json::json!({
            "timestamp": self.timestamp
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64(),
            "event_type": self.event_type,
            "severity": self.severity,
            "details": self.details,
            "process_id": std::process::id(),
        });
        if let Some(ids) = &self.ids {
            entry["game_id"] = serde_json::json!(ids.game_id);
            if let Some(agent_id) = ids.agent_id {
                entry["agent_id"] = serde_json::json!(agent_id);
            }
            if let Some(name) = &ids.agent_name {
                entry["agent_name"] = serde_json::json!(name);
            }
            if let Some(pid) = ids.pid {
                entry["pid"] = serde_json::json!(pid);
            }
        }
        entry
    }
}

pub struct AuditLogger {
    audit_file: Arc<Mutex<File>>,
    audit_path: PathBuf,
}

impl AuditLogger {
    pub fn new(audit_path: PathBuf) -> Result<Self> {
        if let Some(parent) = audit_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ArenaError::Config(format!("Failed to create audit log directory: {}", e))
            })?;
        }
        let audit_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&audit_path)
            .map_err(|e| ArenaError::Config(format!("Failed to open audit log: {}", e)))?;
        Ok(Self {
            audit_file: Arc::new(Mutex::new(audit_file)),
            audit_path,
        })
    }

    pub fn log_event(&self, event: &GameEvent) {
        echo(event);
        let entry = event.to_json();
        if let Ok(mut file) = self.audit_file.lock() {
            if let Err(e) = writeln!(file, "{}", entry) {
                error!("Failed to write to audit log: {}", e);
            }
            if let Err(e) = file.flush() {
                error!("Failed to flush audit log: {}", e);
            }
        } else {
            error!("Failed to acquire lock on audit file");
        }
    }

    pub fn audit_path(&self) -> &PathBuf {
        &self.audit_path
    }
}

fn echo(event: &GameEvent) {
    match event.severity {
        AuditSeverity::Critical | AuditSeverity::High => {
            error!("AUDIT {:?}: {}", event.event_type, event.details)
        }
        AuditSeverity::Medium => warn!("AUDIT {:?}: {}", event.event_type, event.details),
        AuditSeverity::Low => info!("AUDIT {:?}: {}", event.event_type, event.details),
    }
}

static AUDIT_LOGGER: OnceLock<AuditLogger> = OnceLock::new();

/// Install the process-wide audit logger. Falls back to a per-uid file in the
/// temp dir, then to log-only events.
pub fn init_audit_logger(audit_path: PathBuf) {
    let fallback = std::env::temp_dir().join(format!(
        "arenabox-audit-{}.log",
        nix::unistd::geteuid().as_raw()
    ));
    for path in [audit_path, fallback] {
        match AuditLogger::new(path.clone()) {
            Ok(logger) => {
                if AUDIT_LOGGER.set(logger).is_err() {
                    warn!("Audit logger already initialized");
                } else {
                    info!("Audit log at {}", path.display());
                }
                return;
            }
            Err(e) => warn!("Audit log unavailable at {}: {}", path.display(), e),
        }
    }
    warn!("Continuing with log-only audit events");
}

pub fn log_event(event: GameEvent) {
    match AUDIT_LOGGER.get() {
        Some(logger) => logger.log_event(&event),
        None => echo(&event),
    }
}

pub fn game_start(ids: GameIds, agents: usize, game_type: &str) {
    log_event(
        GameEvent::new(
            GameEventType::GameStart,
            format!("{} game started with {} agents", game_type, agents),
        )
        .with_ids(ids),
    );
}

pub fn game_end(ids: GameIds, reason: EndReason, duration_secs: f64) {
    log_event(
        GameEvent::new(
            GameEventType::GameEnd,
            format!("Game ended: reason={:?}, duration={:.2}s", reason, duration_secs),
        )
        .with_ids(ids),
    );
}

pub fn agent_spawned(ids: GameIds) {
    log_event(GameEvent::new(GameEventType::AgentSpawned, "Agent started".into()).with_ids(ids));
}

pub fn agent_spawn_failed(ids: GameIds, error: &str) {
    log_event(
        GameEvent::new(GameEventType::AgentSpawnFailed, format!("Spawn failed: {}", error))
            .with_ids(ids),
    );
}

pub fn agent_died(ids: GameIds, tripwire: bool) {
    let details = if tripwire {
        "Tripwire agent died".to_string()
    } else {
        "Agent died".to_string()
    };
    log_event(GameEvent::new(GameEventType::AgentDied, details).with_ids(ids));
}

pub fn service_started(ids: GameIds, url: &str) {
    log_event(
        GameEvent::new(GameEventType::ServiceStarted, format!("Move service at {}", url))
            .with_ids(ids),
    );
}

pub fn service_failed(ids: GameIds, error: &str) {
    log_event(
        GameEvent::new(GameEventType::ServiceFailed, format!("Move service failed: {}", error))
            .with_ids(ids),
    );
}

pub fn probe_degraded(ids: GameIds, probe: &str) {
    log_event(
        GameEvent::new(GameEventType::ProbeDegraded, format!("Probe not attached: {}", probe))
            .with_ids(ids),
    );
}

pub fn cleanup_outcome(ids: GameIds, errors: &[String]) {
    let event = if errors.is_empty() {
        GameEvent::new(GameEventType::CleanupSuccess, "Cleanup complete".into())
    } else {
        GameEvent::new(
            GameEventType::CleanupFailure,
            format!("Cleanup failed: {:?}", errors),
        )
    };
    log_event(event.with_ids(ids));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_builder() {
        let ids = GameIds::new("g1").with_agent(2, "beta").with_pid(1234);
        assert_eq!(ids.agent_id, Some(2));
        assert_eq!(ids.agent_name.as_deref(), Some("beta"));
        assert_eq!(ids.pid, Some(1234));
    }

    #[test]
    fn severities() {
        assert_eq!(GameEventType::GameStart.default_severity(), AuditSeverity::Low);
        assert_eq!(
            GameEventType::CleanupFailure.default_severity(),
            AuditSeverity::Critical
        );
        assert_eq!(
            GameEventType::ProbeDegraded.default_severity(),
            AuditSeverity::Medium
        );
    }

    #[test]
    fn logger_appends_json_lines() {
        let path = std::env::temp_dir().join(format!("arenabox-audit-{}.log", uuid::Uuid::new_v4()));
        let logger = AuditLogger::new(path.clone()).unwrap();
        logger.log_event(
            &GameEvent::new(GameEventType::AgentDied, "Agent died".into())
                .with_ids(GameIds::new("g1").with_agent(0, "alpha")),
        );
        logger.log_event(&GameEvent::new(GameEventType::GameEnd, "done".into()));

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event_type"], "AgentDied");
        assert_eq!(lines[0]["agent_name"], "alpha");
        assert_eq!(lines[0]["game_id"], "g1");
        assert!(lines[1].get("game_id").is_none());
        let _ = std::fs::remove_file(path);
    }
}
