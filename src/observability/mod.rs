//! Observability
//!
//! Structured audit events for each game run.

pub mod audit;
