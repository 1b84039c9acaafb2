//! Process launch: a `LaunchSpec` describes what to start, `ProcessHandle`
//! owns what was started.

use crate::config::types::{ArenaError, Result};
use log::debug;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fs::File;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// Search path handed to every launched process.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const SU: &str = "su";
const SHELL: &str = "/bin/sh";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Identity the process ends up running as; informational for callers.
    pub user: Option<String>,
    /// Complete environment; nothing is inherited.
    pub env: Vec<(String, String)>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    /// Start as leader of a new process group.
    pub own_group: bool,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            user: None,
            env: vec![("PATH".to_string(), DEFAULT_PATH.to_string())],
            stdout: None,
            stderr: None,
            own_group: true,
        }
    }

    /// `su -s /bin/sh -c "<interpreter> <program>; exit $?" <user>`.
    ///
    /// The su process is the root pid, the shell its child and the
    /// interpreter the shell's child. The trailing `exit` keeps shells that
    /// exec their last command from folding the interpreter into the shell pid.
    pub fn privilege_switch(user: &str, interpreter: &str, program: &Path) -> Self {
        let script = format!(
            "{}; exit $?",
            interpreter_command(interpreter, program)
                .iter()
                .map(|s| shell_quote(s))
                .collect::<Vec<_>>()
                .join(" ")
        );
        let mut spec = Self::new(SU)
            .arg("-s")
            .arg(SHELL)
            .arg("-c")
            .arg(script)
            .arg(user);
        spec.user = Some(user.to_string());
        spec
    }

    /// `<interpreter> <program>` as the calling user.
    pub fn current_user(interpreter: &str, program: &Path) -> Self {
        let mut parts = interpreter_command(interpreter, program).into_iter();
        let mut spec = Self::new(parts.next().unwrap_or_else(|| interpreter.to_string()));
        for part in parts {
            spec = spec.arg(part);
        }
        spec
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set or replace one environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.env.retain(|(k, _)| k != &key);
        self.env.push((key, value.into()));
        self
    }

    pub fn get_env(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    pub fn stderr_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr = Some(path.into());
        self
    }

    pub fn launch(&self) -> Result<ProcessHandle> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(redirect(self.stdout.as_deref())?)
            .stderr(redirect(self.stderr.as_deref())?);
        if self.own_group {
            command.process_group(0);
        }

        let child = command.spawn().map_err(|e| {
            ArenaError::Spawn(format!("cannot start {}: {}", self.program.display(), e))
        })?;
        debug!("Started {} as pid {}", self.program.display(), child.id());
        Ok(ProcessHandle {
            pid: child.id(),
            child,
            own_group: self.own_group,
            status: None,
        })
    }
}

fn redirect(path: Option<&Path>) -> Result<Stdio> {
    match path {
        Some(path) => Ok(Stdio::from(File::create(path).map_err(|e| {
            ArenaError::Spawn(format!("cannot open log {}: {}", path.display(), e))
        })?)),
        None => Ok(Stdio::null()),
    }
}

/// Python gets `-u` so agent logs are not block-buffered.
fn interpreter_command(interpreter: &str, program: &Path) -> Vec<String> {
    let mut parts = vec![interpreter.to_string()];
    let is_python = Path::new(interpreter)
        .file_name()
        .and_then(|n| n.to_str())
        .map_or(false, |n| n.starts_with("python"));
    if is_python {
        parts.push("-u".to_string());
    }
    parts.push(program.display().to_string());
    parts
}

fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:,".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// An owned, started process.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    own_group: bool,
    status: Option<ExitStatus>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking liveness check; reaps the process once it has exited.
    pub fn poll(&mut self) -> Result<bool> {
        if self.status.is_some() {
            return Ok(false);
        }
        match self.child.try_wait()? {
            Some(status) => {
                debug!("pid {} exited: {}", self.pid, status);
                self.status = Some(status);
                Ok(false)
            }
            None => Ok(true),
        }
    }

    pub fn is_alive(&mut self) -> bool {
        self.poll().unwrap_or(false)
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.status
    }

    pub fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self.child.wait()?;
        self.status = Some(status);
        Ok(status)
    }

    /// Wait at most `timeout`; `None` if still running.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.poll()? {
                return Ok(self.status);
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// SIGKILL the process (its whole group when it leads one). A process
    /// that is already gone is not an error.
    pub fn kill(&mut self) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        let raw = self.pid as i32;
        let target = if self.own_group { Pid::from_raw(-raw) } else { Pid::from_raw(raw) };
        match signal::kill(target, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ArenaError::Process(format!("kill {}: {}", self.pid, e))),
        }
    }
}
