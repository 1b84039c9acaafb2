//! Process events as persisted in the event log.

use serde::{Deserialize, Serialize};

/// uid recorded when the owner of a pid could not be determined.
pub const UNKNOWN_UID: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "E")]
    Exec,
    #[serde(rename = "X")]
    Exit,
    #[serde(rename = "K")]
    Kill,
}

/// One observed process event.
///
/// For `Kill` events `pid`/`uid`/`comm` describe the sender and `kill_pid`
/// the target. A negative `kill_pid` is a process-group kill.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelEvent {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub pid: u32,
    pub ppid: u32,
    pub uid: u32,
    pub comm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_pid: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<i32>,
}

impl KernelEvent {
    pub fn exec(timestamp: String, pid: u32, ppid: u32, uid: u32, comm: impl Into<String>) -> Self {
        Self {
            timestamp,
            event_type: EventType::Exec,
            pid,
            ppid,
            uid,
            comm: comm.into(),
            kill_pid: None,
            sig: None,
        }
    }

    pub fn exit(timestamp: String, pid: u32, ppid: u32, uid: u32, comm: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Exit,
            ..Self::exec(timestamp, pid, ppid, uid, comm)
        }
    }

    pub fn kill(
        timestamp: String,
        sender: u32,
        ppid: u32,
        uid: u32,
        comm: impl Into<String>,
        target: i32,
        sig: Option<i32>,
    ) -> Self {
        Self {
            event_type: EventType::Kill,
            kill_pid: Some(target),
            sig,
            ..Self::exec(timestamp, sender, ppid, uid, comm)
        }
    }

    /// Target pid of a kill, with group kills folded onto the group leader.
    pub fn kill_target(&self) -> Option<u32> {
        match (self.event_type, self.kill_pid) {
            (EventType::Kill, Some(target)) if target != 0 && target != -1 => {
                Some(target.unsigned_abs())
            }
            _ => None,
        }
    }

    /// `kill(-pgid, sig)` addresses a whole process group.
    pub fn is_group_kill(&self) -> bool {
        self.event_type == EventType::Kill && self.kill_pid.map_or(false, |target| target < -1)
    }

    /// `kill(pid, 0)` only checks existence; it never terminates anything.
    pub fn is_existence_probe(&self) -> bool {
        self.event_type == EventType::Kill && self.sig == Some(0)
    }
}
