//! Game controller: spawn every agent, run the liveness loop until a win
//! condition fires, then finalize.
//!
//! Liveness comes from polling the agents' own processes, never from the
//! tracer, so a degraded tracer cannot change who the controller thinks died.
//! Finalization runs exactly once whichever way the game ends, and again from
//! `Drop` if the caller never got that far.

use crate::config::agent::AgentConfig;
use crate::config::types::{ArenaEnv, ArenaError, EndReason, GameSettings, GameType, Result};
use crate::game::agent::{assign_teams, Agent, AgentLauncher, PrivilegeSwitch};
use crate::game::result::{AgentOutcome, GameResult, ResultWriter};
use crate::game::rules::{AgentStatus, TickState, WinCondition};
use crate::game::services::{move_service_spec, ServiceProcess, TurnSource, TurnWatcher, TURN_POLL_INTERVAL};
use crate::kernel::credentials::AgentIdentity;
use crate::kernel::signal;
use crate::observability::audit::{self, GameIds};
use crate::safety::cleanup::CleanupManager;
use crate::server::registry::{new_api_key, write_credentials, Credentials};
use crate::trace::{ProbeSource, Tracer, TracerConfig};
use log::{debug, error, info, warn};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::thread;
use std::time::{Duration, Instant};

const SERVICE_READY_TIMEOUT: Duration = Duration::from_secs(15);
const CONFIRM_DEAD_TIMEOUT: Duration = Duration::from_secs(2);

pub struct GameController {
    game_id: String,
    env: ArenaEnv,
    settings: GameSettings,
    condition: WinCondition,
    agents: Vec<Agent>,
    identity: Option<AgentIdentity>,
    launcher: Box<dyn AgentLauncher>,
    probe_source: Option<Box<dyn ProbeSource>>,
    tracer: Option<Tracer>,
    service: Option<ServiceProcess>,
    turns: Option<Box<dyn TurnSource>>,
    turn_watcher: Option<TurnWatcher>,
    cleanup: CleanupManager,
    writer: ResultWriter,
    started: Option<Instant>,
    result: Option<GameResult>,
}

impl GameController {
    /// Competitors get ids in config order; the tripwire agent, if any, is last.
    pub fn new(
        env: ArenaEnv,
        settings: GameSettings,
        configs: Vec<AgentConfig>,
        tripwire: Option<AgentConfig>,
    ) -> Result<Self> {
        if configs.is_empty() {
            return Err(ArenaError::Config("at least one agent config is required".into()));
        }
        if settings.game_type == GameType::Tripwire && tripwire.is_none() {
            warn!("Tripwire game without a tripwire agent plays as direct elimination");
        }
        if settings.game_type != GameType::Tripwire && tripwire.is_some() {
            warn!("Tripwire agent supplied to a {} game; its death never ends it", settings.game_type);
        }

        let teams = (settings.game_type == GameType::Team)
            .then(|| assign_teams(&configs, settings.team_size));
        let team_names: BTreeSet<String> = teams.iter().flatten().cloned().collect();

        let mut agents: Vec<Agent> = configs
            .into_iter()
            .enumerate()
            .map(|(i, config)| {
                let mut agent = Agent::new(i as u32, config, false);
                if let Some(teams) = &teams {
                    let team = teams[i].clone();
                    agent.other_team = team_names.iter().find(|t| **t != team).cloned();
                    agent.team = Some(team);
                }
                agent
            })
            .collect();
        if let Some(config) = tripwire {
            agents.push(Agent::new(agents.len() as u32, config, true));
        }

        Ok(Self {
            game_id: uuid::Uuid::new_v4().to_string(),
            launcher: Box::new(PrivilegeSwitch {
                user: env.agent_user.clone(),
            }),
            writer: ResultWriter::new(env.result_path()),
            condition: settings.game_type.into(),
            env,
            settings,
            agents,
            identity: None,
            probe_source: None,
            tracer: None,
            service: None,
            turns: None,
            turn_watcher: None,
            cleanup: CleanupManager::new(),
            started: None,
            result: None,
        })
    }

    /// Restrict tracing to, and sweep, this account's processes.
    pub fn with_identity(mut self, identity: AgentIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_launcher(mut self, launcher: Box<dyn AgentLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Use this source instead of discovering tracefs.
    pub fn with_probe_source(mut self, source: Box<dyn ProbeSource>) -> Self {
        self.probe_source = Some(source);
        self
    }

    pub fn with_turn_source(mut self, turns: Box<dyn TurnSource>) -> Self {
        self.turns = Some(turns);
        self
    }

    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn result(&self) -> Option<&GameResult> {
        self.result.as_ref()
    }

    fn ids(&self) -> GameIds {
        GameIds::new(self.game_id.clone())
    }

    /// Set up, play and finalize one game. A failed setup still writes an
    /// `aborted` result before the error is returned.
    pub fn run(&mut self) -> Result<GameResult> {
        self.started = Some(Instant::now());
        audit::game_start(self.ids(), self.agents.len(), self.settings.game_type.as_str());

        if let Err(e) = self.setup() {
            error!("Game setup failed: {}", e);
            if let Err(fin) = self.finalize(EndReason::Aborted) {
                error!("Finalization after failed setup also failed: {}", fin);
            }
            return Err(e);
        }
        let reason = self.play();
        self.finalize(reason)
    }

    fn setup(&mut self) -> Result<()> {
        fs::create_dir_all(&self.env.root_logs)?;
        fs::create_dir_all(&self.env.agent_logs)?;
        if let Some(identity) = &self.identity {
            self.cleanup.record_user(identity.uid);
        } else {
            warn!("No agent identity: tracing every uid and skipping the per-user kill sweep");
        }

        self.start_tracer()?;
        let server_url = self.start_service()?;
        self.spawn_agents(server_url.as_deref());
        Ok(())
    }

    fn start_tracer(&mut self) -> Result<()> {
        let config = TracerConfig {
            monitored_uids: self
                .identity
                .as_ref()
                .map(|id| HashSet::from([id.uid])),
            log_path: Some(self.env.events_path()),
            ..TracerConfig::default()
        };
        let mut tracer = Tracer::new(config);
        let report = match self.probe_source.take() {
            Some(source) => tracer.start_with_source(source)?,
            None => tracer.start()?,
        };
        for (attached, probe) in [
            (report.exit_attached, "process exit"),
            (report.kill_attached, "kill"),
        ] {
            if !attached {
                audit::probe_degraded(self.ids(), probe);
            }
        }
        self.tracer = Some(tracer);
        Ok(())
    }

    /// Start the move service when some agent needs it. Returns the URL agents use.
    fn start_service(&mut self) -> Result<Option<String>> {
        if self.settings.without_service || !self.agents.iter().any(|a| a.config.uses_service()) {
            debug!("No agent uses the move service");
            if self.settings.max_turns.is_some() && self.turns.is_none() {
                warn!("Turn limit set but no move service runs; only the timeout applies");
            }
            return Ok(None);
        }

        let mut credentials = Credentials::new();
        for agent in self.agents.iter_mut().filter(|a| a.config.uses_service()) {
            let key = new_api_key();
            agent.api_key = Some(key.clone());
            credentials.insert(key, agent.config.clone());
        }
        let path = std::env::temp_dir().join(format!(
            "arenabox-credentials-{}.json",
            uuid::Uuid::new_v4().simple()
        ));
        write_credentials(&path, &credentials)?;
        self.cleanup.record_temp_file(&path);

        let exe = match &self.settings.service_exe {
            Some(exe) => exe.clone(),
            None => std::env::current_exe()?,
        };
        let port = self.settings.port;
        let spec = move_service_spec(&exe, &self.env, &path, port, self.settings.simultaneous_turns);
        let mut service = ServiceProcess::start("move service", &spec, format!("http://127.0.0.1:{}", port))
            .map_err(|e| {
                audit::service_failed(self.ids(), &e.to_string());
                e
            })?;
        self.cleanup.record_process_group(service.pid());

        let ready = service.wait_ready(SERVICE_READY_TIMEOUT);
        let url = service.url().to_string();
        self.service = Some(service);
        let client = ready.map_err(|e| {
            audit::service_failed(self.ids(), &e.to_string());
            e
        })?;
        audit::service_started(self.ids(), &url);
        if self.turns.is_none() {
            self.turns = Some(Box::new(client));
        }
        Ok(Some(format!("http://localhost:{}", port)))
    }

    fn spawn_agents(&mut self, server_url: Option<&str>) {
        for i in 0..self.agents.len() {
            let ids = self.ids().with_agent(self.agents[i].id, self.agents[i].name().to_string());
            match self.spawn_agent(i, server_url) {
                Ok(pid) => audit::agent_spawned(ids.with_pid(pid)),
                Err(e) => {
                    warn!("Agent '{}' failed to start: {}", self.agents[i].name(), e);
                    self.agents[i].mark_spawn_failed();
                    audit::agent_spawn_failed(ids, &e.to_string());
                }
            }
        }
    }

    fn spawn_agent(&mut self, index: usize, server_url: Option<&str>) -> Result<u32> {
        let agent = &mut self.agents[index];
        let program = agent.materialize(&self.env, self.identity.as_ref())?;
        self.cleanup.record_temp_file(&program);
        let spec = agent.launch_spec(
            &self.env,
            self.launcher.as_ref(),
            &self.settings.interpreter,
            server_url,
        )?;
        agent.start(&spec)
    }

    fn poll_agents(&mut self) {
        for agent in &mut self.agents {
            if agent.poll() {
                info!(
                    "Agent {} '{}' is no longer alive{}",
                    agent.id,
                    agent.name(),
                    if agent.is_tripwire { " (tripwire)" } else { "" }
                );
                let mut ids = GameIds::new(self.game_id.clone()).with_agent(agent.id, agent.name().to_string());
                if let Some(pid) = agent.pid() {
                    ids = ids.with_pid(pid);
                }
                audit::agent_died(ids, agent.is_tripwire);
            }
        }
    }

    fn statuses(&self) -> Vec<AgentStatus> {
        self.agents
            .iter()
            .map(|a| AgentStatus {
                id: a.id,
                alive: a.is_alive(),
                is_tripwire: a.is_tripwire,
                team: a.team.clone(),
            })
            .collect()
    }

    /// Hand the turn source to a watcher thread when a turn limit applies.
    fn watch_turns(&mut self) {
        if self.settings.max_turns.is_none() {
            return;
        }
        let Some(source) = self.turns.take() else {
            return;
        };
        match TurnWatcher::spawn(source, TURN_POLL_INTERVAL) {
            Ok(watcher) => self.turn_watcher = Some(watcher),
            Err(e) => warn!("Turn limit disabled: {}", e),
        }
    }

    fn current_turn(&self) -> Option<u64> {
        self.turn_watcher.as_ref()?.latest()
    }

    /// Tick until a win condition, the turn limit, the timeout or a shutdown
    /// signal ends the game.
    fn play(&mut self) -> EndReason {
        let start = self.started.unwrap_or_else(Instant::now);
        info!(
            "Game {} running: {} agents, {} rules, timeout {:?}",
            self.game_id,
            self.agents.len(),
            self.settings.game_type,
            self.settings.timeout
        );
        self.watch_turns();
        loop {
            self.poll_agents();
            let tick = TickState {
                elapsed: start.elapsed(),
                timeout: self.settings.timeout,
                turn: self.current_turn(),
                max_turns: self.settings.max_turns,
                interrupted: !signal::should_continue(),
            };
            if let Some(reason) = self.condition.evaluate(&self.statuses(), &tick) {
                // Let near-simultaneous deaths land in the same result.
                thread::sleep(self.settings.settle);
                self.poll_agents();
                info!("Game {} over: {:?} after {:?}", self.game_id, reason, start.elapsed());
                return reason;
            }
            thread::sleep(self.settings.tick);
        }
    }

    /// Terminate everything, write the result once, release every resource.
    /// Later calls return the first result unchanged.
    pub fn finalize(&mut self, reason: EndReason) -> Result<GameResult> {
        if let Some(result) = &self.result {
            debug!("Game {} already finalized", self.game_id);
            return Ok(result.clone());
        }
        info!("Finalizing game {} ({:?})", self.game_id, reason);

        // Outcomes are fixed before the forced kills below.
        let outcomes: Vec<AgentOutcome> = self.agents.iter().map(Agent::outcome).collect();

        for agent in &mut self.agents {
            if let Err(e) = agent.terminate() {
                warn!("Failed to kill agent '{}': {}", agent.name(), e);
            }
        }
        if let Some(identity) = &self.identity {
            match signal::kill_user_processes(identity.uid) {
                Ok(report) if !report.killed.is_empty() => info!(
                    "Killed {} leftover processes of {} in {} sweeps",
                    report.killed.len(),
                    identity.name,
                    report.sweeps
                ),
                Ok(_) => {}
                Err(e) => warn!("Kill sweep for {} failed: {}", identity.name, e),
            }
        }
        for agent in &mut self.agents {
            if !agent.confirm_dead(CONFIRM_DEAD_TIMEOUT) {
                warn!("Agent '{}' still running after termination", agent.name());
            }
        }

        let result = GameResult {
            agents: outcomes,
            end_reason: Some(reason),
            duration_secs: self.started.map_or(0.0, |s| s.elapsed().as_secs_f64()),
        };
        let written = self.writer.write(&result);
        self.result = Some(result.clone());

        if let Some(mut watcher) = self.turn_watcher.take() {
            watcher.stop();
        }
        if let Some(mut service) = self.service.take() {
            service.terminate();
        }
        if let Some(mut tracer) = self.tracer.take() {
            if let Err(e) = tracer.stop() {
                warn!("Tracer did not stop cleanly: {}", e);
            }
        }
        if let Err(e) = self.cleanup.cleanup_all() {
            error!("{}", e);
        }
        audit::cleanup_outcome(self.ids(), self.cleanup.get_errors());
        audit::game_end(self.ids(), reason, result.duration_secs);

        written?;
        Ok(result)
    }
}

impl Drop for GameController {
    fn drop(&mut self) {
        if self.started.is_some() && self.result.is_none() {
            if let Err(e) = self.finalize(EndReason::Interrupted) {
                error!("Finalization on drop failed: {}", e);
            }
        }
    }
}
