/// Core types shared by the tracer, barrier, controller and analyzer
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Port the move-generation service listens on unless told otherwise.
pub const DEFAULT_SERVER_PORT: u16 = 5000;

/// Header carrying the per-agent credential on every service request.
pub const API_KEY_HEADER: &str = "X-Agent-API-Key";

/// Environment switch that turns the turn barrier on in the service.
pub const SIMULTANEOUS_TURNS_ENV: &str = "LLM_SERVER_SIMULTANEOUS_TURNS";

pub const EVENTS_FILE: &str = "process_events.json";
pub const RESULT_FILE: &str = "game_result.json";
pub const AUDIT_FILE: &str = "arena-audit.log";
pub const INTERACTIONS_FILE: &str = "llm_interactions.jsonl";

/// Error types for arenabox
#[derive(Error, Debug)]
pub enum ArenaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Trace error: {0}")]
    Trace(String),

    #[error("Probe attachment error: {0}")]
    Probe(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Privilege error: {0}")]
    Privilege(String),

    #[error("Analysis error: {0}")]
    Analysis(String),

    #[error(
        "Inconsistent game {game}: agent {agent_id} ({name}) was_killed={was_killed} but attributed_kill={attributed}"
    )]
    Inconsistent {
        game: String,
        agent_id: u32,
        name: String,
        was_killed: bool,
        attributed: bool,
    },
}

/// Result type alias for arenabox operations
pub type Result<T> = std::result::Result<T, ArenaError>;

/// Win-condition family selected at game configuration time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameType {
    /// First competitor to die ends the game.
    #[serde(rename = "direct")]
    Direct,
    /// Direct elimination plus a protected non-competing agent.
    #[serde(rename = "tripwire")]
    Tripwire,
    /// Game ends when a whole team is down.
    #[serde(rename = "team")]
    Team,
}

impl GameType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Tripwire => "tripwire",
            Self::Team => "team",
        }
    }
}

impl fmt::Display for GameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GameType {
    type Err = ArenaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" | "elimination" => Ok(Self::Direct),
            "tripwire" | "protected" => Ok(Self::Tripwire),
            "team" => Ok(Self::Team),
            other => Err(ArenaError::Config(format!(
                "unknown game type '{}': expected direct, tripwire or team",
                other
            ))),
        }
    }
}

/// Text-generation provider backing an agent's moves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    Openai,
    Openrouter,
    Hyperbolic,
    Fireworks,
    Gemini,
}

impl Provider {
    pub const ALL: [Provider; 6] = [
        Provider::Anthropic,
        Provider::Openai,
        Provider::Openrouter,
        Provider::Hyperbolic,
        Provider::Fireworks,
        Provider::Gemini,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::Openai => "openai",
            Self::Openrouter => "openrouter",
            Self::Hyperbolic => "hyperbolic",
            Self::Fireworks => "fireworks",
            Self::Gemini => "gemini",
        }
    }

    /// Environment variable holding this provider's API key.
    pub fn key_env_var(self) -> &'static str {
        match self {
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::Openai => "OPENAI_API_KEY",
            Self::Openrouter => "OPENROUTER_API_KEY",
            Self::Hyperbolic => "HYPERBOLIC_API_KEY",
            Self::Fireworks => "FIREWORKS_API_KEY",
            Self::Gemini => "GEMINI_API_KEY",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = ArenaError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| ArenaError::Config(format!("unknown provider '{}'", s)))
    }
}

/// Why a game stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Elimination,
    Timeout,
    TurnLimit,
    Interrupted,
    Aborted,
}

/// Knobs for a single game instance.
#[derive(Clone, Debug)]
pub struct GameSettings {
    pub game_type: GameType,
    pub timeout: Duration,
    pub max_turns: Option<u64>,
    pub simultaneous_turns: bool,
    pub team_size: usize,
    pub port: u16,
    /// Interpreter used when an agent config does not name one.
    pub interpreter: String,
    pub tick: Duration,
    pub settle: Duration,
    /// Executable started as `<exe> serve ...`; defaults to the running binary.
    pub service_exe: Option<PathBuf>,
    /// Skip the move-generation service entirely (agents that never call it).
    pub without_service: bool,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            game_type: GameType::Direct,
            timeout: Duration::from_secs(60),
            max_turns: None,
            simultaneous_turns: false,
            team_size: 2,
            port: DEFAULT_SERVER_PORT,
            interpreter: "/usr/bin/python3".to_string(),
            tick: Duration::from_millis(50),
            settle: Duration::from_millis(250),
            service_exe: None,
            without_service: false,
        }
    }
}

/// Paths and identity shared between the controller and every agent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArenaEnv {
    pub agent_space: PathBuf,
    pub agent_logs: PathBuf,
    pub agent_user: String,
    pub root_logs: PathBuf,
    pub root_space: Option<PathBuf>,
}

impl ArenaEnv {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; empty values count as missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| -> Result<String> {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| {
                    ArenaError::Config(format!("environment variable {} is not set", name))
                })
        };

        Ok(Self {
            agent_space: PathBuf::from(required("AGENT_SPACE")?),
            agent_logs: PathBuf::from(required("AGENT_LOGS")?),
            agent_user: required("AGENT_USER")?,
            root_logs: PathBuf::from(required("ROOT_LOGS")?),
            root_space: lookup("ROOT_SPACE")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        })
    }

    pub fn events_path(&self) -> PathBuf {
        self.root_logs.join(EVENTS_FILE)
    }

    pub fn result_path(&self) -> PathBuf {
        self.root_logs.join(RESULT_FILE)
    }

    pub fn audit_path(&self) -> PathBuf {
        self.root_logs.join(AUDIT_FILE)
    }

    pub fn interactions_path(&self) -> PathBuf {
        self.root_logs.join(INTERACTIONS_FILE)
    }

    /// Resolve a possibly-relative path against the agent workspace.
    pub fn in_agent_space(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.agent_space.join(path)
        }
    }
}
