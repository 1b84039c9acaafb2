//! The unprivileged execution identity agents run under.
//!
//! Agents never run as root; the identity is resolved once per game from
//! the account name in the environment contract.

mod identity;
mod validation;

pub use identity::AgentIdentity;
pub use validation::validate_ids;
