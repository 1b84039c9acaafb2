//! Kernel event tracer: attaches a probe source, runs the delivery loop on a
//! background thread and appends enriched events to the event log.

use crate::config::types::{ArenaError, Result};
use crate::trace::event::{KernelEvent, UNKNOWN_UID};
use crate::trace::log::EventLog;
use crate::trace::parse::{ProbeRecord, RecordKind};
use crate::trace::procinfo::ProcResolver;
use crate::trace::source::{AttachReport, ProbeSource, TracefsSource};
use chrono::{DateTime, Duration as ChronoDuration, Local};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, info, warn};
use nix::time::{clock_gettime, ClockId};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Reads allowed after a stop request before the loop gives up draining.
const MAX_DRAIN_READS: usize = 256;

#[derive(Clone, Debug)]
pub struct TracerConfig {
    /// Only events from these uids are recorded; `None` records everyone.
    /// Events whose uid cannot be resolved are always recorded.
    pub monitored_uids: Option<HashSet<u32>>,
    /// Event log file; `None` keeps events in memory only.
    pub log_path: Option<PathBuf>,
    /// Wait between empty reads of the source.
    pub idle_wait: Duration,
    pub proc_root: PathBuf,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            monitored_uids: None,
            log_path: None,
            idle_wait: Duration::from_millis(20),
            proc_root: PathBuf::from("/proc"),
        }
    }
}

/// Event counters shared with the delivery thread.
#[derive(Debug, Default)]
pub struct TracerStats {
    pub recorded: AtomicU64,
    pub filtered: AtomicU64,
    /// Recorded events whose sender had already left procfs unseen.
    pub unresolved: AtomicU64,
    pub errors: AtomicU64,
}

struct Worker {
    shutdown: Sender<()>,
    handle: JoinHandle<Result<()>>,
}

pub struct Tracer {
    config: TracerConfig,
    log: Arc<Mutex<EventLog>>,
    stats: Arc<TracerStats>,
    worker: Option<Worker>,
    report: Option<AttachReport>,
}

impl Tracer {
    pub fn new(config: TracerConfig) -> Self {
        Self {
            config,
            log: Arc::new(Mutex::new(EventLog::new())),
            stats: Arc::new(TracerStats::default()),
            worker: None,
            report: None,
        }
    }

    /// Attach to tracefs and begin capture.
    pub fn start(&mut self) -> Result<AttachReport> {
        let source = TracefsSource::discover()?;
        self.start_with_source(Box::new(source))
    }

    /// Begin capture from an arbitrary source. Attachment happens on the
    /// calling thread so a fatal probe failure reaches the caller.
    pub fn start_with_source(&mut self, mut source: Box<dyn ProbeSource>) -> Result<AttachReport> {
        if self.worker.is_some() {
            return Err(ArenaError::Trace("tracer already started".into()));
        }

        let log = match &self.config.log_path {
            Some(path) => EventLog::create(path)?,
            None => EventLog::new(),
        };
        *self.log.lock().unwrap_or_else(|e| e.into_inner()) = log;

        let report = source.attach()?;
        info!("Tracer attached via {} ({})", source.name(), report.exec_probe);

        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let mut builder = EventBuilder::new(&self.config, report.monotonic_clock);
        let log = Arc::clone(&self.log);
        let stats = Arc::clone(&self.stats);
        let idle_wait = self.config.idle_wait;

        let handle = thread::Builder::new()
            .name("arenabox-tracer".into())
            .spawn(move || {
                let mut batch = Vec::new();
                let mut stopping = false;
                let mut drain_reads = 0;
                loop {
                    batch.clear();
                    let read = match source.read_records(&mut batch) {
                        Ok(n) => Some(n),
                        Err(e) => {
                            stats.errors.fetch_add(1, Ordering::Relaxed);
                            warn!("Trace read failed: {}", e);
                            None
                        }
                    };
                    for record in batch.drain(..) {
                        deliver(&mut builder, record, &log, &stats);
                    }
                    if read == Some(0) {
                        flush(&log, &stats);
                    }

                    if stopping {
                        drain_reads += 1;
                        if read == Some(0) || drain_reads >= MAX_DRAIN_READS {
                            break;
                        }
                        continue;
                    }

                    if read.unwrap_or(0) > 0 {
                        match shutdown_rx.try_recv() {
                            Ok(()) | Err(TryRecvError::Disconnected) => stopping = true,
                            Err(TryRecvError::Empty) => {}
                        }
                        continue;
                    }

                    match shutdown_rx.recv_timeout(idle_wait) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => stopping = true,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                }
                debug!("Tracer loop drained, detaching {}", source.name());
                source.detach()
            })
            .map_err(|e| ArenaError::Trace(format!("cannot spawn tracer thread: {}", e)))?;

        self.worker = Some(Worker {
            shutdown: shutdown_tx,
            handle,
        });
        self.report = Some(report.clone());
        Ok(report)
    }

    /// Drain pending events, detach probes and join the delivery thread.
    /// Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let _ = worker.shutdown.send(());
        let outcome = worker
            .handle
            .join()
            .map_err(|_| ArenaError::Trace("tracer thread panicked".into()))?;
        let finished = self.log.lock().unwrap_or_else(|e| e.into_inner()).finish();
        info!(
            "Tracer stopped: {} recorded, {} filtered, {} unresolved, {} errors",
            self.stats.recorded.load(Ordering::Relaxed),
            self.stats.filtered.load(Ordering::Relaxed),
            self.stats.unresolved.load(Ordering::Relaxed),
            self.stats.errors.load(Ordering::Relaxed)
        );
        outcome.and(finished)
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Events observed so far.
    pub fn events(&self) -> Vec<KernelEvent> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .events()
            .to_vec()
    }

    pub fn stats(&self) -> &TracerStats {
        &self.stats
    }

    pub fn attach_report(&self) -> Option<&AttachReport> {
        self.report.as_ref()
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Tracer stop during drop failed: {}", e);
        }
    }
}

fn deliver(
    builder: &mut EventBuilder,
    record: ProbeRecord,
    log: &Mutex<EventLog>,
    stats: &TracerStats,
) {
    let Some(event) = builder.build(record) else {
        return;
    };
    if !builder.admits(event.uid) {
        stats.filtered.fetch_add(1, Ordering::Relaxed);
        return;
    }
    if event.uid == UNKNOWN_UID {
        stats.unresolved.fetch_add(1, Ordering::Relaxed);
    }
    let mut guard = log.lock().unwrap_or_else(|e| e.into_inner());
    match guard.append(event) {
        Ok(()) => {
            stats.recorded.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            warn!("Failed to persist trace event: {}", e);
        }
    }
}

fn flush(log: &Mutex<EventLog>, stats: &TracerStats) {
    if let Err(e) = log.lock().unwrap_or_else(|e| e.into_inner()).flush() {
        stats.errors.fetch_add(1, Ordering::Relaxed);
        warn!("Failed to flush trace events: {}", e);
    }
}

/// Maps trace-clock seconds to wall-clock time.
#[derive(Clone, Copy, Debug)]
struct ClockAnchor {
    wall: DateTime<Local>,
    mono: f64,
}

impl ClockAnchor {
    fn now() -> Option<Self> {
        let ts = clock_gettime(ClockId::CLOCK_MONOTONIC).ok()?;
        Some(Self {
            wall: Local::now(),
            mono: ts.tv_sec() as f64 + ts.tv_nsec() as f64 / 1e9,
        })
    }

    fn wall_time(&self, ktime: f64) -> DateTime<Local> {
        let delta_us = ((ktime - self.mono) * 1e6).round() as i64;
        self.wall + ChronoDuration::microseconds(delta_us)
    }
}

/// Turns raw probe records into log events.
struct EventBuilder {
    resolver: ProcResolver,
    monitored: Option<HashSet<u32>>,
    anchor: Option<ClockAnchor>,
}

impl EventBuilder {
    fn new(config: &TracerConfig, monotonic_clock: bool) -> Self {
        Self {
            resolver: ProcResolver::with_root(config.proc_root.clone()),
            monitored: config.monitored_uids.clone(),
            anchor: if monotonic_clock { ClockAnchor::now() } else { None },
        }
    }

    /// A sender that vanished before it could be resolved may still be one of
    /// ours; only known foreign uids are dropped.
    fn admits(&self, uid: u32) -> bool {
        uid == UNKNOWN_UID
            || self
                .monitored
                .as_ref()
                .map_or(true, |allowed| allowed.contains(&uid))
    }

    fn timestamp(&self, ktime: Option<f64>) -> String {
        let at = match (self.anchor, ktime) {
            (Some(anchor), Some(ktime)) => anchor.wall_time(ktime),
            _ => Local::now(),
        };
        at.to_rfc3339()
    }

    fn build(&mut self, record: ProbeRecord) -> Option<KernelEvent> {
        let timestamp = self.timestamp(record.ktime);
        match record.kind {
            RecordKind::Fork { child_pid, .. } => {
                self.resolver.note_fork(record.pid, child_pid);
                None
            }
            RecordKind::Exec => {
                let info = self.resolver.lookup(record.pid);
                Some(KernelEvent::exec(
                    timestamp,
                    record.pid,
                    info.ppid.unwrap_or(0),
                    info.uid.unwrap_or(UNKNOWN_UID),
                    record.comm,
                ))
            }
            RecordKind::Exit => {
                let info = self.resolver.lookup(record.pid);
                self.resolver.forget(record.pid);
                Some(KernelEvent::exit(
                    timestamp,
                    record.pid,
                    info.ppid.unwrap_or(0),
                    info.uid.unwrap_or(UNKNOWN_UID),
                    record.comm,
                ))
            }
            RecordKind::Kill { target, sig } => {
                let info = self.resolver.lookup(record.pid);
                // The trace prefix carries the thread id; genealogies hold processes.
                let sender = info.tgid.unwrap_or(record.pid);
                let parent = if sender == record.pid {
                    info.ppid
                } else {
                    self.resolver.lookup(sender).ppid
                };
                Some(KernelEvent::kill(
                    timestamp,
                    sender,
                    parent.unwrap_or(0),
                    info.uid.unwrap_or(UNKNOWN_UID),
                    record.comm,
                    target,
                    Some(sig),
                ))
            }
        }
    }
}
