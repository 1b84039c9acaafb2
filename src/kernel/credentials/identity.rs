use super::validation::validate_ids;
use crate::config::types::{ArenaError, Result};
use nix::unistd::User;

/// Resolved account the agents are launched as.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentIdentity {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}

impl AgentIdentity {
    /// Look the account up in the user database and reject root.
    pub fn resolve(name: &str) -> Result<Self> {
        let user = User::from_name(name)
            .map_err(|e| ArenaError::Privilege(format!("user lookup for '{}' failed: {}", name, e)))?
            .ok_or_else(|| ArenaError::Privilege(format!("user '{}' does not exist", name)))?;

        let identity = Self {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
        };
        validate_ids(identity.uid, identity.gid)?;
        log::info!(
            "Agent identity: {} (uid={}, gid={})",
            identity.name,
            identity.uid,
            identity.gid
        );
        Ok(identity)
    }
}
