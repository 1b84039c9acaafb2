/// Cleanup and resource management for a game run
///
/// Every resource is recorded right after it is created and released in
/// reverse creation order. Released entries leave the ledger, so repeating
/// `cleanup_all` after a partial failure only retries what is still held.
use crate::config::types::{ArenaError, Result};
use crate::kernel::signal::{kill_user_processes_in, terminate_process_group, user_pids};
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Grace between SIGTERM and SIGKILL for service process groups.
pub const SERVICE_GRACE: Duration = Duration::from_millis(500);

/// Resource types that need cleanup
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceType {
    /// Every process owned by an agent uid.
    UserProcesses,
    /// A helper service started in its own process group.
    ProcessGroup,
    /// A file that must not outlive the run (credentials, materialized programs).
    TempFile,
}

/// Resource ledger entry
#[derive(Debug, Clone)]
pub struct ResourceEntry {
    pub resource_type: ResourceType,
    pub identifier: String,
    pub path: Option<PathBuf>,
    pub created_at: std::time::SystemTime,
}

/// Resources recorded immediately after successful creation
#[derive(Debug, Default)]
pub struct ResourceLedger {
    entries: Vec<ResourceEntry>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, resource_type: ResourceType, identifier: String, path: Option<PathBuf>) {
        let entry = ResourceEntry {
            resource_type,
            identifier,
            path,
            created_at: std::time::SystemTime::now(),
        };
        debug!("Recording resource: {:?}", entry);
        self.entries.push(entry);
    }

    pub fn get_by_type(&self, resource_type: &ResourceType) -> Vec<&ResourceEntry> {
        self.entries
            .iter()
            .filter(|e| &e.resource_type == resource_type)
            .collect()
    }

    /// Entries in reverse creation order (for cleanup)
    pub fn reverse_order(&self) -> Vec<ResourceEntry> {
        self.entries.iter().rev().cloned().collect()
    }

    pub fn remove(&mut self, resource_type: &ResourceType, identifier: &str) {
        self.entries
            .retain(|e| !(&e.resource_type == resource_type && e.identifier == identifier));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }
}

/// Cleanup manager with idempotent operations
pub struct CleanupManager {
    ledger: ResourceLedger,
    cleanup_errors: Vec<String>,
    proc_root: PathBuf,
}

impl Default for CleanupManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CleanupManager {
    pub fn new() -> Self {
        Self::with_proc_root("/proc")
    }

    pub fn with_proc_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            ledger: ResourceLedger::new(),
            cleanup_errors: Vec::new(),
            proc_root: proc_root.into(),
        }
    }

    pub fn record_resource(&mut self, resource_type: ResourceType, identifier: String, path: Option<PathBuf>) {
        self.ledger.record(resource_type, identifier, path);
    }

    pub fn record_user(&mut self, uid: u32) {
        self.record_resource(ResourceType::UserProcesses, uid.to_string(), None);
    }

    pub fn record_process_group(&mut self, pgid: u32) {
        self.record_resource(ResourceType::ProcessGroup, pgid.to_string(), None);
    }

    pub fn record_temp_file(&mut self, path: &Path) {
        self.record_resource(
            ResourceType::TempFile,
            path.display().to_string(),
            Some(path.to_path_buf()),
        );
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// Release everything still held, newest first.
    pub fn cleanup_all(&mut self) -> Result<()> {
        if self.ledger.is_empty() {
            return Ok(());
        }
        info!("Starting cleanup of {} resources", self.ledger.count());

        let mut failed_cleanups = Vec::new();
        for entry in self.ledger.reverse_order() {
            match self.cleanup_resource(&entry) {
                Ok(()) => {
                    debug!("Cleaned up {:?} {}", entry.resource_type, entry.identifier);
                    self.ledger.remove(&entry.resource_type, &entry.identifier);
                }
                Err(e) => {
                    let error_msg = format!("Failed to cleanup {}: {}", entry.identifier, e);
                    warn!("{}", error_msg);
                    self.cleanup_errors.push(error_msg);
                    failed_cleanups.push(entry.identifier.clone());
                }
            }
        }

        if !failed_cleanups.is_empty() {
            return Err(ArenaError::Process(format!(
                "Cleanup failed for {} resources: {:?}",
                failed_cleanups.len(),
                failed_cleanups
            )));
        }

        info!("Cleanup complete");
        Ok(())
    }

    fn cleanup_resource(&self, entry: &ResourceEntry) -> Result<()> {
        match entry.resource_type {
            ResourceType::UserProcesses => self.cleanup_user(entry),
            ResourceType::ProcessGroup => self.cleanup_group(entry),
            ResourceType::TempFile => self.cleanup_file(entry),
        }
    }

    fn cleanup_user(&self, entry: &ResourceEntry) -> Result<()> {
        let uid = parse_id(entry)?;
        let report = kill_user_processes_in(&self.proc_root, uid)?;
        let left = user_pids(&self.proc_root, uid);
        if !left.is_empty() {
            return Err(ArenaError::Process(format!(
                "{} processes of uid {} survived {} sweeps: {:?}",
                left.len(),
                uid,
                report.sweeps,
                left
            )));
        }
        Ok(())
    }

    fn cleanup_group(&self, entry: &ResourceEntry) -> Result<()> {
        let pgid = parse_id(entry)?;
        let report = terminate_process_group(pgid, SERVICE_GRACE);
        for note in &report.notes {
            debug!("Group {}: {}", pgid, note);
        }
        Ok(())
    }

    fn cleanup_file(&self, entry: &ResourceEntry) -> Result<()> {
        let Some(path) = &entry.path else {
            return Ok(());
        };
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Already removed: {}", path.display());
                Ok(())
            }
            Err(e) => Err(ArenaError::Io(e)),
        }
    }

    pub fn get_errors(&self) -> &[String] {
        &self.cleanup_errors
    }

    pub fn has_errors(&self) -> bool {
        !self.cleanup_errors.is_empty()
    }
}

fn parse_id(entry: &ResourceEntry) -> Result<u32> {
    entry
        .identifier
        .parse()
        .map_err(|_| ArenaError::Process(format!("Invalid id in ledger: {}", entry.identifier)))
}
