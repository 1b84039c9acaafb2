/// Async-safe signal handling and process termination primitives
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::config::types::{ArenaError, Result};

/// Global shutdown flag (async-safe atomic)
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Global signal received (async-safe atomic)
static SIGNAL_RECEIVED: AtomicU32 = AtomicU32::new(0);

/// Upper bound on kill sweeps; a forking process can outrun a single pass.
const MAX_KILL_SWEEPS: u32 = 8;
const SWEEP_PAUSE: Duration = Duration::from_millis(25);

/// Signal handler state
pub struct SignalHandler;

impl SignalHandler {
    /// Install handlers for SIGINT, SIGTERM and SIGHUP.
    /// Must be called before any threads are spawned.
    pub fn init() -> Result<Self> {
        let sig_action = SigAction::new(
            SigHandler::Handler(Self::signal_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
            // SAFETY: the handler only touches atomics.
            unsafe { signal::sigaction(sig, &sig_action) }.map_err(|e| {
                ArenaError::Process(format!("Failed to install {} handler: {}", sig, e))
            })?;
        }

        info!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
        Ok(Self)
    }

    /// Only performs atomic stores - no allocations, no locks, no I/O
    extern "C" fn signal_handler(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal as u32, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Signal that was received (0 if none)
    pub fn get_signal(&self) -> u32 {
        SIGNAL_RECEIVED.load(Ordering::SeqCst)
    }
}

/// Main loop helper: false once a shutdown signal arrived.
pub fn should_continue() -> bool {
    !SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Outcome of a termination attempt.
#[derive(Clone, Debug, Default)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    pub waited_ms: u64,
    /// Every pid a SIGKILL was delivered to.
    pub killed: Vec<u32>,
    pub sweeps: u32,
    pub notes: Vec<String>,
}

/// SIGTERM the group, give it `grace`, then SIGKILL whatever is left.
pub fn terminate_process_group(pgid: u32, grace: Duration) -> KillReport {
    let mut report = KillReport::default();
    let start = Instant::now();
    let group = Pid::from_raw(-(pgid as i32));
    let leader = Pid::from_raw(pgid as i32);

    match signal::kill(group, Signal::SIGTERM) {
        Ok(()) => report.term_sent = true,
        Err(Errno::ESRCH) => {
            debug!("Process group {} already gone", pgid);
            report.waited_ms = start.elapsed().as_millis() as u64;
            return report;
        }
        Err(e) => {
            let _ = signal::kill(leader, Signal::SIGTERM);
            report.term_sent = true;
            report
                .notes
                .push(format!("group SIGTERM fallback used: {}", e));
        }
    }

    std::thread::sleep(grace);

    match signal::kill(group, Signal::SIGKILL) {
        Ok(()) => report.kill_sent = true,
        Err(Errno::ESRCH) => {}
        Err(e) => {
            let _ = signal::kill(leader, Signal::SIGKILL);
            report.kill_sent = true;
            report
                .notes
                .push(format!("group SIGKILL fallback used: {}", e));
        }
    }

    report.waited_ms = start.elapsed().as_millis() as u64;
    report
}

/// SIGKILL every process owned by `uid`, sweeping until none are left.
///
/// Refuses uid 0: a root sweep would take the host down with it.
pub fn kill_user_processes(uid: u32) -> Result<KillReport> {
    kill_user_processes_in(Path::new("/proc"), uid)
}

pub fn kill_user_processes_in(proc_root: &Path, uid: u32) -> Result<KillReport> {
    if uid == 0 {
        return Err(ArenaError::Privilege(
            "refusing to kill every process owned by root".to_string(),
        ));
    }

    let mut report = KillReport::default();
    let start = Instant::now();
    let me = std::process::id();

    while report.sweeps < MAX_KILL_SWEEPS {
        let targets: Vec<u32> = user_pids(proc_root, uid)
            .into_iter()
            .filter(|pid| *pid != me)
            .collect();
        if targets.is_empty() {
            break;
        }
        report.sweeps += 1;
        for pid in targets {
            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) => {
                    report.kill_sent = true;
                    if !report.killed.contains(&pid) {
                        report.killed.push(pid);
                    }
                }
                Err(Errno::ESRCH) => {}
                Err(e) => report.notes.push(format!("kill({}) failed: {}", pid, e)),
            }
        }
        std::thread::sleep(SWEEP_PAUSE);
    }

    if report.sweeps == MAX_KILL_SWEEPS && !user_pids(proc_root, uid).is_empty() {
        warn!(
            "Processes of uid {} still present after {} kill sweeps",
            uid, MAX_KILL_SWEEPS
        );
        report
            .notes
            .push(format!("uid {} not empty after {} sweeps", uid, MAX_KILL_SWEEPS));
    }

    report.waited_ms = start.elapsed().as_millis() as u64;
    Ok(report)
}

/// Live (non-zombie) pids whose real uid is `uid`.
pub fn user_pids(proc_root: &Path, uid: u32) -> Vec<u32> {
    let Ok(entries) = fs::read_dir(proc_root) else {
        return Vec::new();
    };

    let mut pids = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(status) = fs::read_to_string(entry.path().join("status")) else {
            continue;
        };
        let mut owner = None;
        let mut zombie = false;
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("Uid:") {
                owner = rest.split_whitespace().next().and_then(|v| v.parse::<u32>().ok());
            } else if let Some(rest) = line.strip_prefix("State:") {
                zombie = rest.trim_start().starts_with('Z');
            }
        }
        if owner == Some(uid) && !zombie {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    pids
}

/// Existence check via signal 0.
pub fn is_alive(pid: u32) -> bool {
    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
