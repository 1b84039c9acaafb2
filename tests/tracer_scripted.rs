//! Integration tests for the tracer through the probe-source seam
//!
//! A scripted source replaces tracefs and a scratch directory replaces procfs.

use arenabox::trace::log::EventLog;
use arenabox::trace::parse::{ProbeRecord, RecordKind};
use arenabox::trace::{AttachReport, EventType, ProbeSource, Tracer, TracerConfig};
use arenabox::Result;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Delivers its records in batches of `batch`, then reports nothing.
struct BatchSource {
    records: Vec<ProbeRecord>,
    batch: usize,
    detaches: Arc<AtomicUsize>,
    kill_probe: bool,
}

impl ProbeSource for BatchSource {
    fn name(&self) -> &str {
        "batch"
    }

    fn attach(&mut self) -> Result<AttachReport> {
        Ok(AttachReport {
            exec_probe: "scripted:exec".into(),
            exit_attached: true,
            kill_attached: self.kill_probe,
            fork_attached: false,
            monotonic_clock: false,
        })
    }

    fn read_records(&mut self, out: &mut Vec<ProbeRecord>) -> Result<usize> {
        let n = self.batch.min(self.records.len());
        out.extend(self.records.drain(..n));
        Ok(n)
    }

    fn detach(&mut self) -> Result<()> {
        self.detaches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn record(pid: u32, comm: &str, kind: RecordKind) -> ProbeRecord {
    ProbeRecord {
        pid,
        comm: comm.into(),
        ktime: None,
        kind,
    }
}

fn fake_proc(entries: &[(u32, u32, u32)]) -> PathBuf {
    let root = std::env::temp_dir().join(format!("arenabox-proc-{}", uuid::Uuid::new_v4()));
    for (pid, ppid, uid) in entries {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("status"),
            format!("Tgid:\t{}\nPPid:\t{}\nUid:\t{}\t{}\t{}\t{}\n", pid, ppid, uid, uid, uid, uid),
        )
        .unwrap();
    }
    root
}

#[test]
fn test_stop_drains_then_detaches_and_log_matches() {
    let proc_root = fake_proc(&[(100, 1, 1001), (101, 100, 1001), (200, 1, 1001), (9, 1, 0)]);
    let log_path = std::env::temp_dir().join(format!("arenabox-events-{}.json", uuid::Uuid::new_v4()));
    let detaches = Arc::new(AtomicUsize::new(0));

    let mut records = vec![
        record(100, "su", RecordKind::Exec),
        record(101, "python3", RecordKind::Exec),
        record(200, "su", RecordKind::Exec),
        record(9, "sshd", RecordKind::Exec),
    ];
    // Enough traffic that the stop request lands while records are pending.
    for _ in 0..50 {
        records.push(record(101, "python3", RecordKind::Kill { target: 200, sig: 0 }));
    }
    records.push(record(101, "python3", RecordKind::Kill { target: 200, sig: 9 }));
    records.push(record(200, "su", RecordKind::Exit));
    let expected = records.len() - 1;

    let mut tracer = Tracer::new(TracerConfig {
        monitored_uids: Some([1001].into_iter().collect()),
        log_path: Some(log_path.clone()),
        proc_root: proc_root.clone(),
        ..TracerConfig::default()
    });
    let report = tracer
        .start_with_source(Box::new(BatchSource {
            records,
            batch: 3,
            detaches: Arc::clone(&detaches),
            kill_probe: true,
        }))
        .unwrap();
    assert!(report.kill_attached);
    assert!(tracer.is_running());

    tracer.stop().unwrap();
    tracer.stop().unwrap();
    assert!(!tracer.is_running());
    assert_eq!(detaches.load(Ordering::SeqCst), 1);

    let events = tracer.events();
    assert_eq!(events.len(), expected);
    assert!(events.iter().all(|e| e.uid == 1001));
    assert_eq!(events[1].ppid, 100);

    let kill = &events[events.len() - 2];
    assert_eq!(kill.event_type, EventType::Kill);
    assert_eq!(kill.pid, 101);
    assert_eq!(kill.kill_pid, Some(200));
    assert_eq!(kill.sig, Some(9));
    assert_eq!(events.last().unwrap().event_type, EventType::Exit);

    assert_eq!(EventLog::load(&log_path).unwrap(), events);

    let _ = fs::remove_file(log_path);
    let _ = fs::remove_dir_all(proc_root);
}

#[test]
fn test_missing_kill_probe_is_reported_not_fatal() {
    let mut tracer = Tracer::new(TracerConfig::default());
    let report = tracer
        .start_with_source(Box::new(BatchSource {
            records: Vec::new(),
            batch: 1,
            detaches: Arc::new(AtomicUsize::new(0)),
            kill_probe: false,
        }))
        .unwrap();
    assert!(!report.kill_attached);
    assert_eq!(tracer.attach_report().map(|r| r.kill_attached), Some(false));
    tracer.stop().unwrap();
    assert!(tracer.events().is_empty());
}
