//! Auxiliary service lifecycle (the move-generation service subprocess).

use crate::config::types::{ArenaEnv, ArenaError, Provider, Result};
use crate::game::launch::{LaunchSpec, ProcessHandle};
use crate::kernel::signal::{terminate_process_group, KillReport};
use crate::safety::cleanup::SERVICE_GRACE;
use crate::server::client::MoveClient;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const SERVICE_LOG: &str = "llm_server.log";
pub const SERVICE_ERROR_LOG: &str = "llm_server_error.log";

const READY_POLL: Duration = Duration::from_millis(100);

/// Wait between turn counter reads.
pub const TURN_POLL_INTERVAL: Duration = Duration::from_millis(500);

const NO_TURN: u64 = u64::MAX;

/// Source of the global turn counter.
pub trait TurnSource: Send {
    fn turn_count(&self) -> Result<u64>;
}

impl TurnSource for MoveClient {
    fn turn_count(&self) -> Result<u64> {
        MoveClient::turn_count(self)
    }
}

/// Reads a turn source on its own thread and keeps the last answer, so a slow
/// service never holds up liveness polling.
pub struct TurnWatcher {
    latest: Arc<AtomicU64>,
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TurnWatcher {
    pub fn spawn(source: Box<dyn TurnSource>, interval: Duration) -> Result<Self> {
        let latest = Arc::new(AtomicU64::new(NO_TURN));
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let seen = Arc::clone(&latest);
        let handle = thread::Builder::new()
            .name("arenabox-turns".into())
            .spawn(move || loop {
                match source.turn_count() {
                    Ok(turn) => seen.store(turn.min(NO_TURN - 1), Ordering::Relaxed),
                    Err(e) => debug!("Turn count unavailable: {}", e),
                }
                match shutdown_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| ArenaError::Service(format!("cannot spawn turn watcher: {}", e)))?;
        Ok(Self {
            latest,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Last turn count read, `None` until the first read succeeds.
    pub fn latest(&self) -> Option<u64> {
        match self.latest.load(Ordering::Relaxed) {
            NO_TURN => None,
            turn => Some(turn),
        }
    }

    /// Idempotent. Waits out a read already in flight.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Turn watcher thread panicked");
            }
        }
    }
}

impl Drop for TurnWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// `<exe> serve ...` with output in ROOT_LOGS and provider keys passed through.
pub fn move_service_spec(
    exe: &Path,
    env: &ArenaEnv,
    credentials: &Path,
    port: u16,
    simultaneous_turns: bool,
) -> LaunchSpec {
    let mut spec = LaunchSpec::new(exe)
        .arg("serve")
        .arg("--credentials")
        .arg(credentials.display().to_string())
        .arg("--port")
        .arg(port.to_string())
        .env("ROOT_LOGS", env.root_logs.display().to_string())
        .stdout_to(env.root_logs.join(SERVICE_LOG))
        .stderr_to(env.root_logs.join(SERVICE_ERROR_LOG));
    if simultaneous_turns {
        spec = spec.arg("--simultaneous-turns");
    }
    let passthrough = Provider::ALL
        .iter()
        .map(|p| p.key_env_var())
        .chain(["RUST_LOG"]);
    for name in passthrough {
        if let Ok(value) = std::env::var(name) {
            spec = spec.env(name, value);
        }
    }
    spec
}

/// A running helper service in its own process group.
pub struct ServiceProcess {
    name: String,
    handle: ProcessHandle,
    url: String,
}

impl ServiceProcess {
    pub fn start(name: &str, spec: &LaunchSpec, url: String) -> Result<Self> {
        let handle = spec
            .launch()
            .map_err(|e| ArenaError::Service(format!("cannot start {}: {}", name, e)))?;
        info!("Started {} (pid {})", name, handle.pid());
        Ok(Self {
            name: name.to_string(),
            handle,
            url,
        })
    }

    pub fn pid(&self) -> u32 {
        self.handle.pid()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Poll `/turn_count` until it answers, the process dies or `timeout` passes.
    pub fn wait_ready(&mut self, timeout: Duration) -> Result<MoveClient> {
        let client = MoveClient::new(self.url.clone(), None, Duration::from_secs(2))?;
        let start = Instant::now();
        loop {
            match client.turn_count() {
                Ok(turn) => {
                    info!("{} ready at {} (turn {})", self.name, self.url, turn);
                    return Ok(client);
                }
                Err(e) => debug!("{} not ready yet: {}", self.name, e),
            }
            if !self.handle.poll()? {
                return Err(ArenaError::Service(format!(
                    "{} exited during startup ({:?})",
                    self.name,
                    self.handle.exit_status()
                )));
            }
            if start.elapsed() >= timeout {
                return Err(ArenaError::Service(format!(
                    "{} did not answer within {:?}",
                    self.name, timeout
                )));
            }
            thread::sleep(READY_POLL);
        }
    }

    /// SIGTERM the group, then SIGKILL after a grace period, then reap.
    pub fn terminate(&mut self) -> KillReport {
        if !self.handle.is_alive() {
            return KillReport::default();
        }
        let report = terminate_process_group(self.handle.pid(), SERVICE_GRACE);
        if self
            .handle
            .wait_timeout(Duration::from_secs(1))
            .ok()
            .flatten()
            .is_none()
        {
            warn!("{} (pid {}) did not exit after termination", self.name, self.handle.pid());
        } else {
            info!("Stopped {}", self.name);
        }
        report
    }
}
