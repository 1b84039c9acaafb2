//! Safety and cleanup
//!
//! Leaves the host as it was found: agent processes, helper services and
//! temporary files are released through one idempotent ledger.

pub mod cleanup;
