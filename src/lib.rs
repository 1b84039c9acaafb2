//! arenabox: referee substrate for adversarial agent games
//!
//! Several untrusted agent programs run side by side under one unprivileged
//! account and try to terminate each other. arenabox runs the game and
//! decides afterwards, from kernel evidence, who killed whom.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::signal`]: Shutdown signals, process-group termination, per-uid kill sweeps
//! - [`kernel::credentials`]: The unprivileged agent identity
//! - [`kernel::tracefs`]: Private tracefs instances and dynamic probes
//!
//! ## Event Tracing ([`trace`])
//! - [`trace::tracer`]: Background capture of exec, exit and kill events
//! - [`trace::source`]: Probe sources (tracefs in production, scripted in tests)
//! - [`trace::log`]: The durable per-game event log
//!
//! ## Turn Synchronization ([`turn`])
//! - [`turn::TurnBarrier`]: Lockstep turns in simultaneous-turn mode
//!
//! ## Move Service ([`server`])
//! - [`server::MoveService`]: Authenticated move generation over HTTP
//! - [`server::backend`]: Text-generation provider backends
//! - [`server::client`]: Client used by agents and the controller
//!
//! ## Game Lifecycle ([`game`])
//! - [`game::controller`]: Spawn, tick, finalize exactly once
//! - [`game::rules`]: Win conditions
//! - [`game::result`]: Write-once game result
//!
//! ## Forensics ([`analysis`])
//! - [`analysis::genealogy`]: Process trees per agent
//! - [`analysis::attribution`]: Who killed whom, checked against the result
//! - [`analysis::stats`]: Leaderboard over many games
//!
//! ## Safety & Observability
//! - [`safety::cleanup`]: Reverse-order teardown of everything a game created
//! - [`observability::audit`]: Structured game audit trail
//!
//! # Design Principles
//!
//! 1. **Kernel as truth** - Deaths are attributed from traced kill events, never from agent output
//! 2. **Liveness from the processes themselves** - A degraded tracer cannot end a game
//! 3. **One result per game** - Finalization is idempotent and the result file is written once
//! 4. **Inconsistency is an error** - The analyzer refuses games whose evidence disagrees with the result

// Kernel Primitives
pub mod kernel;

// Event Tracing
pub mod trace;

// Turn Synchronization
pub mod turn;

// Move Service
pub mod server;

// Game Lifecycle
pub mod game;

// Forensics
pub mod analysis;

// Safety & Cleanup
pub mod safety;

// Observability
pub mod observability;

// Configuration
pub mod config;

// CLI entrypoint wiring shared by the arena binaries.
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
