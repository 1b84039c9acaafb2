//! Kernel event sources.
//!
//! `ProbeSource` is the seam between the tracer's delivery loop and the
//! kernel. The production implementation drives tracefs; tests plug in a
//! scripted source.

use crate::config::types::{ArenaError, Result};
use crate::kernel::tracefs::{self, TraceInstance};
use crate::trace::parse::{parse_line, ProbeRecord, EXEC_KPROBE_EVENT};
use log::{debug, info, warn};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::PathBuf;

/// A place a probe can be attached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbePoint {
    Tracepoint {
        system: &'static str,
        event: &'static str,
    },
    Kprobe {
        symbol: &'static str,
    },
}

impl ProbePoint {
    pub fn describe(&self) -> String {
        match self {
            Self::Tracepoint { system, event } => format!("tracepoint:{}/{}", system, event),
            Self::Kprobe { symbol } => format!("kprobe:{}", symbol),
        }
    }
}

/// Process-creation probe points, tried in order until one attaches.
pub const EXEC_CANDIDATES: [ProbePoint; 5] = [
    ProbePoint::Tracepoint {
        system: "sched",
        event: "sched_process_exec",
    },
    ProbePoint::Kprobe {
        symbol: "__x64_sys_execve",
    },
    ProbePoint::Kprobe {
        symbol: "__arm64_sys_execve",
    },
    ProbePoint::Kprobe {
        symbol: "do_execveat_common.isra.0",
    },
    ProbePoint::Kprobe {
        symbol: "bprm_execve",
    },
];

pub const EXIT_PROBE: ProbePoint = ProbePoint::Tracepoint {
    system: "sched",
    event: "sched_process_exit",
};

pub const KILL_PROBE: ProbePoint = ProbePoint::Tracepoint {
    system: "syscalls",
    event: "sys_enter_kill",
};

pub const FORK_PROBE: ProbePoint = ProbePoint::Tracepoint {
    system: "sched",
    event: "sched_process_fork",
};

/// Which probes ended up attached.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttachReport {
    pub exec_probe: String,
    pub exit_attached: bool,
    pub kill_attached: bool,
    pub fork_attached: bool,
    /// Record timestamps are CLOCK_MONOTONIC seconds.
    pub monotonic_clock: bool,
}

pub trait ProbeSource: Send {
    fn name(&self) -> &str;

    /// Attach every probe. Only failure to attach a creation probe is an error.
    fn attach(&mut self) -> Result<AttachReport>;

    /// Append whatever records are ready without blocking; returns how many
    /// were appended.
    fn read_records(&mut self, out: &mut Vec<ProbeRecord>) -> Result<usize>;

    /// Release every kernel resource. Must be safe to call more than once.
    fn detach(&mut self) -> Result<()>;
}

/// Probe source backed by a private tracefs instance.
pub struct TracefsSource {
    root: PathBuf,
    name: String,
    kprobe_group: String,
    instance: Option<TraceInstance>,
    pipe: Option<File>,
    pending: Vec<u8>,
    malformed: u64,
}

impl TracefsSource {
    pub fn discover() -> Result<Self> {
        Ok(Self::at(tracefs::find_tracefs()?))
    }

    pub fn at(root: PathBuf) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            root,
            name: format!("arenabox-{}", &id[..12]),
            kprobe_group: format!("arenabox_{}", &id[..12]),
            instance: None,
            pipe: None,
            pending: Vec::new(),
            malformed: 0,
        }
    }

    /// Lines that were read but could not be parsed.
    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    fn attach_point(instance: &mut TraceInstance, group: &str, point: &ProbePoint) -> Result<()> {
        match point {
            ProbePoint::Tracepoint { system, event } => instance.enable_event(system, event),
            ProbePoint::Kprobe { symbol } => instance.add_kprobe(group, EXEC_KPROBE_EVENT, symbol),
        }
    }

    fn drain_lines(&mut self, out: &mut Vec<ProbeRecord>) -> usize {
        let mut produced = 0;
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            match parse_line(line) {
                Some(record) => {
                    out.push(record);
                    produced += 1;
                }
                None => {
                    self.malformed += 1;
                    debug!("Dropped trace line: {}", line);
                }
            }
        }
        produced
    }
}

impl ProbeSource for TracefsSource {
    fn name(&self) -> &str {
        "tracefs"
    }

    fn attach(&mut self) -> Result<AttachReport> {
        let mut instance = TraceInstance::create(&self.root, &self.name)?;
        let mut report = AttachReport::default();

        report.monotonic_clock = match instance.set_clock("mono") {
            Ok(()) => true,
            Err(e) => {
                warn!("Trace clock left at default: {}", e);
                false
            }
        };

        for candidate in EXEC_CANDIDATES.iter() {
            match Self::attach_point(&mut instance, &self.kprobe_group, candidate) {
                Ok(()) => {
                    report.exec_probe = candidate.describe();
                    break;
                }
                Err(e) => debug!("Exec probe {} unavailable: {}", candidate.describe(), e),
            }
        }
        if report.exec_probe.is_empty() {
            let _ = instance.teardown();
            return Err(ArenaError::Probe(format!(
                "no process-creation probe could be attached (tried {})",
                EXEC_CANDIDATES
                    .iter()
                    .map(ProbePoint::describe)
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        report.exit_attached = match Self::attach_point(&mut instance, "", &EXIT_PROBE) {
            Ok(()) => true,
            Err(e) => {
                warn!("Exit probe not attached: {}", e);
                false
            }
        };
        report.kill_attached = match Self::attach_point(&mut instance, "", &KILL_PROBE) {
            Ok(()) => true,
            Err(e) => {
                warn!("Kill probe not attached: {}", e);
                false
            }
        };
        report.fork_attached = match Self::attach_point(&mut instance, "", &FORK_PROBE) {
            Ok(()) => true,
            Err(e) => {
                debug!("Fork probe not attached: {}", e);
                false
            }
        };

        let pipe = match instance.open_pipe() {
            Ok(pipe) => pipe,
            Err(e) => {
                let _ = instance.teardown();
                return Err(e);
            }
        };

        info!(
            "Tracing via {} (exit={}, kill={}, fork={})",
            report.exec_probe, report.exit_attached, report.kill_attached, report.fork_attached
        );
        self.pipe = Some(pipe);
        self.instance = Some(instance);
        Ok(report)
    }

    fn read_records(&mut self, out: &mut Vec<ProbeRecord>) -> Result<usize> {
        let Some(pipe) = self.pipe.as_mut() else {
            return Ok(0);
        };
        let mut buf = [0u8; 16 * 1024];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    self.pending.extend_from_slice(&buf[..n]);
                    if n < buf.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(ArenaError::Trace(format!("trace_pipe read: {}", e))),
            }
        }
        Ok(self.drain_lines(out))
    }

    fn detach(&mut self) -> Result<()> {
        self.pipe = None;
        match self.instance.take() {
            Some(mut instance) => {
                if self.malformed > 0 {
                    warn!("{} trace lines could not be parsed", self.malformed);
                }
                instance.teardown()
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_candidates_start_with_the_tracepoint() {
        assert_eq!(
            EXEC_CANDIDATES[0].describe(),
            "tracepoint:sched/sched_process_exec"
        );
        assert!(EXEC_CANDIDATES[1..]
            .iter()
            .all(|c| matches!(c, ProbePoint::Kprobe { .. })));
    }

    #[test]
    fn attach_fails_when_no_exec_probe_exists() {
        let root = std::env::temp_dir().join(format!("arenabox-src-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(root.join("instances")).unwrap();
        std::fs::write(root.join("kprobe_events"), "").unwrap();

        let mut source = TracefsSource::at(root.clone());
        let err = source.attach().unwrap_err();
        assert!(err.to_string().contains("process-creation"));
        // The half-built instance is gone again.
        assert_eq!(std::fs::read_dir(root.join("instances")).unwrap().count(), 0);
        assert!(source.detach().is_ok());

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn splits_partial_lines_across_reads() {
        let mut source = TracefsSource::at(PathBuf::from("/nonexistent"));
        let mut out = Vec::new();
        source.pending.extend_from_slice(
            b"  sh-5 [000] ..... 1.5: sched_process_exec: filename=/bin/sh pid=5 old_pid=5\n  sh-5 [000] ..... 1.6: sys_kill(pid: 0x",
        );
        assert_eq!(source.drain_lines(&mut out), 1);
        source.pending.extend_from_slice(b"6, sig: 0x9)\ngarbage\n");
        assert_eq!(source.drain_lines(&mut out), 1);
        assert_eq!(out.len(), 2);
        assert_eq!(source.malformed(), 1);
    }
}
