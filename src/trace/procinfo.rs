//! ppid/uid lookup for traced pids.
//!
//! procfs is read fresh on every lookup because an exec after a privilege
//! switch changes the uid of an existing pid. Parentage is the exception: a
//! parent seen in a fork event wins over procfs, whose `PPid` turns into 1
//! once the real parent exits and the child is reparented. The remaining
//! caches only answer for processes that are already gone.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcInfo {
    pub tgid: Option<u32>,
    pub ppid: Option<u32>,
    pub uid: Option<u32>,
}

pub struct ProcResolver {
    root: PathBuf,
    /// Parents recorded from fork events.
    forked: HashMap<u32, u32>,
    /// Parents last read from procfs.
    parents: HashMap<u32, u32>,
    uids: HashMap<u32, u32>,
}

impl ProcResolver {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            forked: HashMap::new(),
            parents: HashMap::new(),
            uids: HashMap::new(),
        }
    }

    /// Fork events give lineage before the child ever shows up in procfs.
    pub fn note_fork(&mut self, parent: u32, child: u32) {
        self.forked.insert(child, parent);
        if let Some(uid) = self.uids.get(&parent).copied() {
            self.uids.insert(child, uid);
        }
    }

    /// Resolve a pid, refreshing the caches from procfs when it is still there.
    pub fn lookup(&mut self, pid: u32) -> ProcInfo {
        let fresh = read_status(&self.root.join(pid.to_string()).join("status"));
        if let Some(ppid) = fresh.ppid {
            self.parents.insert(pid, ppid);
        }
        if let Some(uid) = fresh.uid {
            self.uids.insert(pid, uid);
        }
        ProcInfo {
            tgid: fresh.tgid,
            ppid: self
                .forked
                .get(&pid)
                .copied()
                .or(fresh.ppid)
                .or_else(|| self.parents.get(&pid).copied()),
            uid: fresh.uid.or_else(|| self.uids.get(&pid).copied()),
        }
    }

    /// Drop cached state for a pid that has exited.
    pub fn forget(&mut self, pid: u32) {
        self.forked.remove(&pid);
        self.parents.remove(&pid);
        self.uids.remove(&pid);
    }

    pub fn cached(&self) -> usize {
        self.forked.len().max(self.parents.len()).max(self.uids.len())
    }
}

impl Default for ProcResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn read_status(path: &Path) -> ProcInfo {
    let Ok(status) = fs::read_to_string(path) else {
        return ProcInfo::default();
    };
    let mut info = ProcInfo::default();
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("Tgid:") {
            info.tgid = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix("PPid:") {
            info.ppid = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix("Uid:") {
            info.uid = rest.split_whitespace().next().and_then(|v| v.parse().ok());
        }
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_status(root: &Path, pid: u32, tgid: u32, ppid: u32, uid: u32) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("status"),
            format!(
                "Name:\tpython3\nTgid:\t{}\nPid:\t{}\nPPid:\t{}\nUid:\t{}\t{}\t{}\t{}\n",
                tgid, pid, ppid, uid, uid, uid, uid
            ),
        )
        .unwrap();
    }

    #[test]
    fn reads_procfs_then_falls_back_to_cache() {
        let root = std::env::temp_dir().join(format!("arenabox-procinfo-{}", uuid::Uuid::new_v4()));
        write_status(&root, 200, 200, 100, 1001);

        let mut resolver = ProcResolver::with_root(&root);
        let info = resolver.lookup(200);
        assert_eq!(info.ppid, Some(100));
        assert_eq!(info.uid, Some(1001));
        assert_eq!(info.tgid, Some(200));

        fs::remove_dir_all(root.join("200")).unwrap();
        let gone = resolver.lookup(200);
        assert_eq!(gone.ppid, Some(100));
        assert_eq!(gone.uid, Some(1001));
        assert_eq!(gone.tgid, None);

        resolver.forget(200);
        assert_eq!(resolver.lookup(200), ProcInfo::default());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn fork_inherits_parent_uid() {
        let root = std::env::temp_dir().join(format!("arenabox-procinfo-{}", uuid::Uuid::new_v4()));
        write_status(&root, 300, 300, 1, 1001);
        let mut resolver = ProcResolver::with_root(&root);
        resolver.lookup(300);
        resolver.note_fork(300, 301);

        let child = resolver.lookup(301);
        assert_eq!(child.ppid, Some(300));
        assert_eq!(child.uid, Some(1001));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn reparented_child_keeps_its_fork_parent() {
        let root = std::env::temp_dir().join(format!("arenabox-procinfo-{}", uuid::Uuid::new_v4()));
        write_status(&root, 400, 400, 1, 1001);
        let mut resolver = ProcResolver::with_root(&root);
        resolver.lookup(400);
        resolver.note_fork(400, 401);

        // The parent exited before the child's events were read.
        fs::remove_dir_all(root.join("400")).unwrap();
        write_status(&root, 401, 401, 1, 1001);
        let child = resolver.lookup(401);
        assert_eq!(child.ppid, Some(400));
        assert_eq!(child.uid, Some(1001));

        // Without a fork record procfs is all there is.
        write_status(&root, 500, 500, 1, 1001);
        assert_eq!(resolver.lookup(500).ppid, Some(1));

        resolver.forget(401);
        assert_eq!(resolver.lookup(401).ppid, Some(1));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn thread_ids_resolve_to_their_process() {
        let root = std::env::temp_dir().join(format!("arenabox-procinfo-{}", uuid::Uuid::new_v4()));
        write_status(&root, 402, 400, 1, 1001);
        let mut resolver = ProcResolver::with_root(&root);
        assert_eq!(resolver.lookup(402).tgid, Some(400));
        let _ = fs::remove_dir_all(root);
    }
}
