//! Configuration
//!
//! Shared types, the environment contract and per-agent configuration files.

pub mod agent;
pub mod types;
