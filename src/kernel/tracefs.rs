//! Thin wrapper over the tracefs control files.
//!
//! Every run gets its own trace instance so the global ring buffer and other
//! tracers on the host are left alone. Teardown order matters: events must be
//! disabled before a kprobe definition can be removed, and the instance
//! directory can only be removed once nothing in it is enabled.

use crate::config::types::{ArenaError, Result};
use log::{debug, info, warn};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Candidate tracefs mount points, newest layout first.
pub const TRACEFS_ROOTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

/// Locate a usable tracefs mount.
pub fn find_tracefs() -> Result<PathBuf> {
    TRACEFS_ROOTS
        .iter()
        .map(PathBuf::from)
        .find(|root| root.join("instances").is_dir())
        .ok_or_else(|| {
            ArenaError::Probe(format!(
                "tracefs not mounted (looked in {})",
                TRACEFS_ROOTS.join(", ")
            ))
        })
}

/// A private tracefs instance and the probes enabled in it.
#[derive(Debug)]
pub struct TraceInstance {
    root: PathBuf,
    dir: PathBuf,
    enabled: Vec<PathBuf>,
    kprobes: Vec<String>,
}

impl TraceInstance {
    pub fn create(root: &Path, name: &str) -> Result<Self> {
        let dir = root.join("instances").join(name);
        fs::create_dir(&dir).map_err(|e| {
            ArenaError::Probe(format!(
                "cannot create trace instance {}: {}",
                dir.display(),
                e
            ))
        })?;
        info!("Created trace instance {}", dir.display());
        Ok(Self {
            root: root.to_path_buf(),
            dir,
            enabled: Vec::new(),
            kprobes: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Switch the instance clock; timestamps then share CLOCK_MONOTONIC's epoch.
    pub fn set_clock(&self, clock: &str) -> Result<()> {
        write_control(&self.dir.join("trace_clock"), clock)
    }

    /// Enable `events/<system>/<event>` in this instance.
    pub fn enable_event(&mut self, system: &str, event: &str) -> Result<()> {
        let enable = self.dir.join("events").join(system).join(event).join("enable");
        if !enable.exists() {
            return Err(ArenaError::Probe(format!(
                "event {}/{} not available",
                system, event
            )));
        }
        write_control(&enable, "1")?;
        debug!("Enabled {}/{}", system, event);
        self.enabled.push(enable);
        Ok(())
    }

    /// Define an entry kprobe `<group>/<name>` on `symbol` and enable it here.
    pub fn add_kprobe(&mut self, group: &str, name: &str, symbol: &str) -> Result<()> {
        let definition = format!("p:{}/{} {}", group, name, symbol);
        append_control(&self.root.join("kprobe_events"), &definition)?;
        let full_name = format!("{}/{}", group, name);
        self.kprobes.push(full_name.clone());

        if let Err(e) = self.enable_event(group, name) {
            let _ = append_control(&self.root.join("kprobe_events"), &format!("-:{}", full_name));
            self.kprobes.retain(|k| k != &full_name);
            return Err(e);
        }
        Ok(())
    }

    /// Open the consuming pipe in non-blocking mode.
    pub fn open_pipe(&self) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(self.dir.join("trace_pipe"))
            .map_err(|e| ArenaError::Probe(format!("cannot open trace_pipe: {}", e)))
    }

    /// Disable events, remove kprobes, remove the instance. Safe to repeat.
    pub fn teardown(&mut self) -> Result<()> {
        let mut first_error = None;

        for enable in self.enabled.drain(..).rev() {
            if let Err(e) = write_control(&enable, "0") {
                warn!("Failed to disable {}: {}", enable.display(), e);
                first_error.get_or_insert(e);
            }
        }

        let kprobe_events = self.root.join("kprobe_events");
        for kprobe in self.kprobes.drain(..).rev() {
            if let Err(e) = append_control(&kprobe_events, &format!("-:{}", kprobe)) {
                warn!("Failed to remove kprobe {}: {}", kprobe, e);
                first_error.get_or_insert(e);
            }
        }

        if self.dir.exists() {
            if let Err(e) = fs::remove_dir(&self.dir) {
                warn!("Failed to remove trace instance {}: {}", self.dir.display(), e);
                first_error.get_or_insert(ArenaError::Io(e));
            } else {
                info!("Removed trace instance {}", self.dir.display());
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for TraceInstance {
    fn drop(&mut self) {
        if !self.enabled.is_empty() || !self.kprobes.is_empty() || self.dir.exists() {
            let _ = self.teardown();
        }
    }
}

/// Control files are created by the kernel; never create one ourselves.
fn write_control(path: &Path, value: &str) -> Result<()> {
    OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .and_then(|mut file| file.write_all(value.as_bytes()))
        .map_err(|e| ArenaError::Probe(format!("write '{}' to {}: {}", value, path.display(), e)))
}

/// kprobe_events must be appended to; truncating it drops every definition.
fn append_control(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|e| ArenaError::Probe(format!("open {}: {}", path.display(), e)))?;
    writeln!(file, "{}", line)
        .map_err(|e| ArenaError::Probe(format!("write '{}' to {}: {}", line, path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_tracefs() -> PathBuf {
        let root = std::env::temp_dir().join(format!("arenabox-tracefs-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(root.join("instances")).unwrap();
        fs::write(root.join("kprobe_events"), "").unwrap();
        root
    }

    #[test]
    fn enable_and_teardown_in_a_fake_tracefs() {
        let root = fake_tracefs();
        let mut instance = TraceInstance::create(&root, "arenabox-test").unwrap();
        let event_dir = instance.dir().join("events/sched/sched_process_exec");
        fs::create_dir_all(&event_dir).unwrap();
        fs::write(event_dir.join("enable"), "0").unwrap();

        instance.enable_event("sched", "sched_process_exec").unwrap();
        assert_eq!(fs::read_to_string(event_dir.join("enable")).unwrap(), "1");
        assert!(instance.enable_event("sched", "missing_event").is_err());

        // A plain directory with files in it cannot be removed; tracefs
        // removes the generated event tree itself.
        assert!(instance.teardown().is_err());
        assert_eq!(fs::read_to_string(event_dir.join("enable")).unwrap(), "0");
        fs::remove_dir_all(instance.dir().join("events")).unwrap();
        instance.teardown().unwrap();
        assert!(!instance.dir().exists());

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn failed_kprobe_enable_removes_definition() {
        let root = fake_tracefs();
        let mut instance = TraceInstance::create(&root, "arenabox-kp").unwrap();
        assert!(instance.add_kprobe("arenabox_t", "exec", "bprm_execve").is_err());

        let defs = fs::read_to_string(root.join("kprobe_events")).unwrap();
        assert!(defs.contains("p:arenabox_t/exec bprm_execve"));
        assert!(defs.contains("-:arenabox_t/exec"));

        instance.teardown().unwrap();
        assert!(!root.join("instances/arenabox-kp").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn creating_an_instance_without_tracefs_fails() {
        let missing = std::env::temp_dir().join(format!("arenabox-none-{}", uuid::Uuid::new_v4()));
        assert!(TraceInstance::create(&missing, "x").is_err());
    }
}
