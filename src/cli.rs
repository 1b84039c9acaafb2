use crate::analysis::{analyze_games, render_table};
use crate::config::agent::AgentConfig;
use crate::config::types::{
    ArenaEnv, GameSettings, GameType, DEFAULT_SERVER_PORT, SIMULTANEOUS_TURNS_ENV,
};
use crate::game::{GameController, PrivilegeSwitch};
use crate::kernel::credentials::AgentIdentity;
use crate::kernel::signal::{self, SignalHandler};
use crate::observability::audit;
use crate::server::backend::Backends;
use crate::server::interactions::InteractionLog;
use crate::server::registry::{read_credentials, AgentRegistry};
use crate::server::{serve_until, MoveService};
use crate::turn::BarrierConfig;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CliMode {
    Compat,
    Serve,
    Analyze,
}

impl CliMode {
    fn primary_binary(self) -> &'static str {
        match self {
            Self::Compat => "arena",
            Self::Serve => "arena-serve",
            Self::Analyze => "arena-analyze",
        }
    }

    fn mode_name(self) -> &'static str {
        match self {
            Self::Compat => "compat",
            Self::Serve => "serve",
            Self::Analyze => "analyze",
        }
    }

    fn allows(self, command: &Commands) -> bool {
        match self {
            Self::Compat => true,
            Self::Serve => matches!(command, Commands::Serve { .. }),
            Self::Analyze => matches!(command, Commands::Analyze { .. }),
        }
    }
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one game between the given agents
    Play {
        /// Wall-clock limit in seconds
        #[arg(long, default_value_t = 60)]
        timeout: u64,
        /// End the game once the global turn counter reaches this value
        #[arg(long)]
        max_turns: Option<u64>,
        /// Hold every agent's turn until all agents finished theirs
        #[arg(long)]
        simultaneous_turns: bool,
        /// Win condition: direct, tripwire or team
        #[arg(long, default_value = "direct")]
        game_type: GameType,
        /// Agents per team in team games
        #[arg(long, default_value_t = 2)]
        team_size: usize,
        /// Config of the protected agent in tripwire games
        #[arg(long)]
        tripwire: Option<PathBuf>,
        /// Move service port
        #[arg(long, default_value_t = DEFAULT_SERVER_PORT)]
        port: u16,
        /// Interpreter for agents whose config does not name one
        #[arg(long, default_value = "/usr/bin/python3")]
        interpreter: String,
        /// Pause before finalizing so near-simultaneous deaths are recorded
        #[arg(long, default_value_t = 250)]
        settle_ms: u64,
        /// Liveness poll interval
        #[arg(long, default_value_t = 50)]
        tick_ms: u64,
        /// Agent config files, relative to AGENT_SPACE unless absolute
        configs: Vec<PathBuf>,
    },
    /// Run the move-generation service
    Serve {
        /// Credential file mapping API keys to agent configs
        #[arg(long)]
        credentials: PathBuf,
        #[arg(long, default_value_t = DEFAULT_SERVER_PORT)]
        port: u16,
        /// Enable the turn barrier (also LLM_SERVER_SIMULTANEOUS_TURNS=1)
        #[arg(long)]
        simultaneous_turns: bool,
        /// Seconds a request may wait at the barrier
        #[arg(long, default_value_t = 60)]
        barrier_timeout: u64,
        /// Listen on every interface instead of loopback
        #[arg(long)]
        public: bool,
    },
    /// Attribute kills across recorded games and print the leaderboard
    Analyze {
        /// Directory holding game_* subdirectories
        #[arg(long, default_value = ".")]
        games_dir: PathBuf,
        /// Emit the leaderboard as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Commands {
    fn command_name(&self) -> &'static str {
        match self {
            Self::Play { .. } => "play",
            Self::Serve { .. } => "serve",
            Self::Analyze { .. } => "analyze",
        }
    }
}

fn validate_command_mode(mode: CliMode, command: &Commands) {
    if mode.allows(command) {
        return;
    }

    eprintln!(
        "Error: command '{}' is not available in '{}' mode",
        command.command_name(),
        mode.mode_name()
    );
    eprintln!(
        "Use '{}' for the full command set.",
        CliMode::Compat.primary_binary()
    );
    std::process::exit(2);
}

pub fn run(mode: CliMode) -> Result<()> {
    env_logger::init();

    if !cfg!(unix) {
        eprintln!("Error: {} requires a Unix-like system", mode.primary_binary());
        std::process::exit(1);
    }

    let cli = Cli::parse();
    validate_command_mode(mode, &cli.command);

    match cli.command {
        Commands::Play {
            timeout,
            max_turns,
            simultaneous_turns,
            game_type,
            team_size,
            tripwire,
            port,
            interpreter,
            settle_ms,
            tick_ms,
            configs,
        } => {
            let settings = GameSettings {
                game_type,
                timeout: Duration::from_secs(timeout),
                max_turns,
                simultaneous_turns,
                team_size,
                port,
                interpreter,
                tick: Duration::from_millis(tick_ms),
                settle: Duration::from_millis(settle_ms),
                ..GameSettings::default()
            };
            play(settings, configs, tripwire)
        }
        Commands::Serve {
            credentials,
            port,
            simultaneous_turns,
            barrier_timeout,
            public,
        } => serve(credentials, port, simultaneous_turns, barrier_timeout, public),
        Commands::Analyze { games_dir, json } => {
            let board = analyze_games(&games_dir)
                .with_context(|| format!("analyzing games under {}", games_dir.display()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&board)?);
            } else {
                println!("{}", render_table(&board));
            }
            Ok(())
        }
    }
}

fn play(settings: GameSettings, configs: Vec<PathBuf>, tripwire: Option<PathBuf>) -> Result<()> {
    if configs.is_empty() {
        error!("No agent config files given");
        eprintln!("Error: at least one agent config file is required");
        std::process::exit(1);
    }

    let env = ArenaEnv::from_env()?;
    std::fs::create_dir_all(&env.root_logs)
        .with_context(|| format!("creating {}", env.root_logs.display()))?;
    audit::init_audit_logger(env.audit_path());
    SignalHandler::init()?;

    if nix::unistd::getuid().as_raw() != 0 {
        warn!("Not running as root: switching to {} will likely fail", env.agent_user);
    }
    let identity = AgentIdentity::resolve(&env.agent_user)?;

    let agents = configs
        .iter()
        .map(|path| AgentConfig::load(&env, path))
        .collect::<crate::config::types::Result<Vec<_>>>()?;
    let tripwire = tripwire
        .map(|path| AgentConfig::load(&env, &path))
        .transpose()?;

    let launcher = PrivilegeSwitch {
        user: env.agent_user.clone(),
    };
    let mut controller = GameController::new(env, settings, agents, tripwire)?
        .with_identity(identity)
        .with_launcher(Box::new(launcher));
    let result = controller.run()?;

    info!(
        "Game {} finished: {:?}, {} of {} agents alive",
        controller.game_id(),
        result.end_reason,
        result.survivors().count(),
        result.agents.len()
    );
    Ok(())
}

fn serve(
    credentials: PathBuf,
    port: u16,
    simultaneous_turns: bool,
    barrier_timeout: u64,
    public: bool,
) -> Result<()> {
    SignalHandler::init()?;

    let credentials = read_credentials(&credentials)
        .with_context(|| format!("reading credentials {}", credentials.display()))?;
    let registry = AgentRegistry::from_credentials(&credentials);
    let backends = Backends::from_env(registry.providers())?;

    let interactions = match std::env::var_os("ROOT_LOGS") {
        Some(dir) => InteractionLog::open(&PathBuf::from(dir).join(crate::config::types::INTERACTIONS_FILE))?,
        None => {
            warn!("ROOT_LOGS is not set; interactions are not recorded");
            InteractionLog::disabled()
        }
    };

    let enabled = simultaneous_turns
        || std::env::var(SIMULTANEOUS_TURNS_ENV).map_or(false, |v| v == "1" || v.eq_ignore_ascii_case("true"));
    let barrier = BarrierConfig {
        enabled,
        timeout: Duration::from_secs(barrier_timeout),
        ..BarrierConfig::default()
    };

    let service = Arc::new(MoveService::new(&credentials, backends, barrier, interactions));
    let host = if public { "0.0.0.0" } else { "127.0.0.1" };
    serve_until(&format!("{}:{}", host, port), service, signal::should_continue)?;
    Ok(())
}
