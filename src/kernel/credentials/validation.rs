//! Credential validation logic.

use crate::config::types::{ArenaError, Result};

/// Reject root UIDs/GIDs (0); agents must never share the referee's privileges.
pub fn validate_ids(uid: u32, gid: u32) -> Result<()> {
    if uid == 0 || gid == 0 {
        return Err(ArenaError::Privilege(format!(
            "Agent identity must not be root (uid={}, gid={})",
            uid, gid
        )));
    }
    Ok(())
}
