//! Game lifecycle
//!
//! Launching agents and helper services, evaluating win conditions each tick,
//! and writing the single authoritative result when the game ends.

pub mod agent;
pub mod controller;
pub mod launch;
pub mod result;
pub mod rules;
pub mod services;

pub use agent::{Agent, AgentLauncher, CurrentUser, PrivilegeSwitch};
pub use controller::GameController;
pub use launch::{LaunchSpec, ProcessHandle};
pub use result::{AgentOutcome, GameResult, ResultWriter};
pub use rules::{AgentStatus, TickState, WinCondition};
pub use services::{ServiceProcess, TurnSource, TurnWatcher};
