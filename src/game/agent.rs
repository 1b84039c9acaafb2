//! Runtime state of one participant.

use crate::config::agent::AgentConfig;
use crate::config::types::{ArenaEnv, ArenaError, Result};
use crate::game::launch::{LaunchSpec, ProcessHandle};
use crate::game::result::AgentOutcome;
use crate::kernel::credentials::AgentIdentity;
use log::{info, warn};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Chooses how an agent program is started.
pub trait AgentLauncher: Send + Sync {
    fn base_spec(&self, interpreter: &str, program: &Path) -> LaunchSpec;
}

/// Production launcher: switch to the unprivileged agent user.
pub struct PrivilegeSwitch {
    pub user: String,
}

impl AgentLauncher for PrivilegeSwitch {
    fn base_spec(&self, interpreter: &str, program: &Path) -> LaunchSpec {
        LaunchSpec::privilege_switch(&self.user, interpreter, program)
    }
}

/// Run agents as the calling user.
pub struct CurrentUser;

impl AgentLauncher for CurrentUser {
    fn base_spec(&self, interpreter: &str, program: &Path) -> LaunchSpec {
        LaunchSpec::current_user(interpreter, program)
    }
}

pub fn team_comms_file(env: &ArenaEnv, team: &str) -> PathBuf {
    env.agent_space.join(format!("team_{}_comms.txt", team))
}

/// Team per config: an explicit `team` wins, the rest fill `team_<n>` in
/// config order, `team_size` at a time.
pub fn assign_teams(configs: &[AgentConfig], team_size: usize) -> Vec<String> {
    let size = team_size.max(1);
    configs
        .iter()
        .enumerate()
        .map(|(i, c)| {
            c.team
                .clone()
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| format!("team_{}", i / size))
        })
        .collect()
}

#[derive(Debug)]
pub struct Agent {
    pub id: u32,
    pub config: AgentConfig,
    pub team: Option<String>,
    pub other_team: Option<String>,
    pub is_tripwire: bool,
    pub api_key: Option<String>,
    pub program: Option<PathBuf>,
    handle: Option<ProcessHandle>,
    pid: Option<u32>,
    was_killed: bool,
}

impl Agent {
    pub fn new(id: u32, config: AgentConfig, is_tripwire: bool) -> Self {
        Self {
            id,
            config,
            team: None,
            other_team: None,
            is_tripwire,
            api_key: None,
            program: None,
            handle: None,
            pid: None,
            was_killed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn was_killed(&self) -> bool {
        self.was_killed
    }

    /// Copy the template program to a fresh, uniquely named file in the agent
    /// workspace, owned by the agent user when one is given.
    pub fn materialize(&mut self, env: &ArenaEnv, owner: Option<&AgentIdentity>) -> Result<PathBuf> {
        let template = env.in_agent_space(&self.config.agent_path);
        let file_name = match template.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("agent_{}.{}", uuid::Uuid::new_v4().simple(), ext),
            None => format!("agent_{}", uuid::Uuid::new_v4().simple()),
        };
        let program = env.agent_space.join(file_name);
        fs::copy(&template, &program).map_err(|e| {
            ArenaError::Spawn(format!(
                "cannot copy agent program {} for '{}': {}",
                template.display(),
                self.name(),
                e
            ))
        })?;
        if let Err(e) = fs::set_permissions(&program, fs::Permissions::from_mode(0o644)) {
            let _ = fs::remove_file(&program);
            return Err(e.into());
        }
        if let Some(owner) = owner {
            if let Err(e) = nix::unistd::chown(
                &program,
                Some(nix::unistd::Uid::from_raw(owner.uid)),
                Some(nix::unistd::Gid::from_raw(owner.gid)),
            ) {
                warn!("Cannot hand {} to {}: {}", program.display(), owner.name, e);
            }
        }
        self.program = Some(program.clone());
        Ok(program)
    }

    /// The materialized copy this agent runs, once there is one.
    pub fn program(&self) -> Option<&Path> {
        self.program.as_deref()
    }

    pub fn log_paths(&self, env: &ArenaEnv) -> (PathBuf, PathBuf) {
        let stem = format!("agent_{}_{}", self.name(), self.id);
        (
            env.agent_logs.join(format!("{}_stdout.log", stem)),
            env.agent_logs.join(format!("{}_stderr.log", stem)),
        )
    }

    /// Full launch description: program, environment, log files.
    pub fn launch_spec(
        &self,
        env: &ArenaEnv,
        launcher: &dyn AgentLauncher,
        default_interpreter: &str,
        server_url: Option<&str>,
    ) -> Result<LaunchSpec> {
        let program = self.program.as_deref().ok_or_else(|| {
            ArenaError::Spawn(format!("agent '{}' has no materialized program", self.name()))
        })?;
        let interpreter = self
            .config
            .interpreter
            .as_deref()
            .unwrap_or(default_interpreter);
        let (stdout, stderr) = self.log_paths(env);

        let mut spec = launcher
            .base_spec(interpreter, program)
            .env("AGENT_LOGS", env.agent_logs.display().to_string())
            .env("AGENT_SPACE", env.agent_space.display().to_string())
            .stdout_to(stdout)
            .stderr_to(stderr);
        if let (Some(key), Some(url)) = (&self.api_key, server_url) {
            spec = spec.env("AGENT_API_KEY", key.as_str()).env("ARENA_SERVER_URL", url);
        }
        if let Some(team) = &self.team {
            spec = spec
                .env("TEAM_NAME", team.as_str())
                .env("COMMUNICATION_FILE", team_comms_file(env, team).display().to_string());
            if let Some(other) = &self.other_team {
                spec = spec.env("OTHER_TEAM_NAME", other.as_str());
            }
        }
        Ok(spec)
    }

    pub fn start(&mut self, spec: &LaunchSpec) -> Result<u32> {
        let handle = spec.launch()?;
        let pid = handle.pid();
        info!("Agent {} '{}' started as pid {}", self.id, self.name(), pid);
        self.pid = Some(pid);
        self.handle = Some(handle);
        Ok(pid)
    }

    /// A start that never happened counts as an immediate loss.
    pub fn mark_spawn_failed(&mut self) {
        self.was_killed = true;
    }

    /// Poll liveness and latch death. Returns `true` on the poll that first
    /// observes the agent dead.
    pub fn poll(&mut self) -> bool {
        if self.was_killed {
            return false;
        }
        let alive = match self.handle.as_mut() {
            Some(handle) => handle.is_alive(),
            None => return false,
        };
        if !alive {
            self.was_killed = true;
        }
        !alive
    }

    /// Alive as far as the game is concerned. Never-started agents are not.
    pub fn is_alive(&self) -> bool {
        self.handle.is_some() && !self.was_killed
    }

    /// SIGKILL the agent's process group; the death is not recorded as a kill.
    pub fn terminate(&mut self) -> Result<()> {
        match self.handle.as_mut() {
            Some(handle) => handle.kill(),
            None => Ok(()),
        }
    }

    /// Confirm the root process is gone, reaping it.
    pub fn confirm_dead(&mut self, timeout: std::time::Duration) -> bool {
        match self.handle.as_mut() {
            Some(handle) => matches!(handle.wait_timeout(timeout), Ok(Some(_))),
            None => true,
        }
    }

    pub fn outcome(&self) -> AgentOutcome {
        AgentOutcome {
            id: self.id,
            name: self.config.name.clone(),
            was_killed: self.was_killed,
            pid: self.pid,
            is_tripwire: self.is_tripwire,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str, team: Option<&str>) -> AgentConfig {
        AgentConfig {
            name: name.into(),
            agent_path: PathBuf::from("template.sh"),
            provider: None,
            model: None,
            team: team.map(String::from),
            interpreter: Some("/bin/sh".into()),
        }
    }

    fn env() -> ArenaEnv {
        let root = std::env::temp_dir().join(format!("arenabox-agent-{}", uuid::Uuid::new_v4()));
        let env = ArenaEnv {
            agent_space: root.join("space"),
            agent_logs: root.join("logs"),
            agent_user: "player".into(),
            root_logs: root.join("root_logs"),
            root_space: None,
        };
        fs::create_dir_all(&env.agent_space).unwrap();
        fs::create_dir_all(&env.agent_logs).unwrap();
        env
    }

    #[test]
    fn teams_fill_in_config_order_unless_named() {
        let configs = vec![
            config("a", None),
            config("b", Some("red")),
            config("c", None),
            config("d", None),
        ];
        assert_eq!(assign_teams(&configs, 2), vec!["team_0", "red", "team_1", "team_1"]);
        assert_eq!(assign_teams(&configs, 0)[3], "team_3");
    }

    #[test]
    fn launch_spec_carries_the_environment_contract() {
        let env = env();
        fs::write(env.agent_space.join("template.sh"), "exit 0\n").unwrap();
        let mut agent = Agent::new(3, config("alpha", None), false);
        agent.team = Some("team_0".into());
        agent.other_team = Some("team_1".into());
        agent.api_key = Some("agent_key_x".into());

        let program = agent.materialize(&env, None).unwrap();
        assert!(program.file_name().unwrap().to_str().unwrap().starts_with("agent_"));
        assert_eq!(program.extension().unwrap(), "sh");

        let spec = agent
            .launch_spec(&env, &PrivilegeSwitch { user: "player".into() }, "/usr/bin/python3", Some("http://localhost:5000"))
            .unwrap();
        assert_eq!(spec.args[3], format!("/bin/sh {}; exit $?", program.display()));
        assert_eq!(spec.get_env("AGENT_API_KEY"), Some("agent_key_x"));
        assert_eq!(spec.get_env("ARENA_SERVER_URL"), Some("http://localhost:5000"));
        assert_eq!(spec.get_env("TEAM_NAME"), Some("team_0"));
        assert_eq!(spec.get_env("OTHER_TEAM_NAME"), Some("team_1"));
        assert!(spec.get_env("COMMUNICATION_FILE").unwrap().ends_with("team_team_0_comms.txt"));
        assert!(spec.stdout.as_ref().unwrap().ends_with("agent_alpha_3_stdout.log"));

        let _ = fs::remove_dir_all(env.agent_space.parent().unwrap());
    }

    #[test]
    fn death_is_latched_once() {
        let env = env();
        fs::write(env.agent_space.join("template.sh"), "exit 0\n").unwrap();
        let mut agent = Agent::new(0, config("quick", None), false);
        agent.materialize(&env, None).unwrap();
        let spec = agent.launch_spec(&env, &CurrentUser, "/bin/sh", None).unwrap();
        assert!(spec.get_env("AGENT_API_KEY").is_none());
        agent.start(&spec).unwrap();
        assert!(agent.confirm_dead(std::time::Duration::from_secs(5)));

        assert!(agent.poll());
        assert!(!agent.poll());
        assert!(agent.was_killed());
        assert!(!agent.is_alive());
        assert!(agent.outcome().pid.is_some());

        let _ = fs::remove_dir_all(env.agent_space.parent().unwrap());
    }

    #[test]
    fn unstarted_agent_is_not_alive() {
        let mut agent = Agent::new(1, config("ghost", None), false);
        assert!(!agent.is_alive());
        agent.mark_spawn_failed();
        assert!(agent.outcome().was_killed);
        assert_eq!(agent.outcome().pid, None);
    }
}
