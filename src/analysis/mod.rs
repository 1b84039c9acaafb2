//! Offline forensics
//!
//! Rebuilds process genealogies from a game's event log, attributes each
//! death to a killer and aggregates many games into a leaderboard.

pub mod attribution;
pub mod genealogy;
pub mod stats;

pub use attribution::{attribute_game, AgentTally, GameAttribution, FATAL_PIDS_PER_AGENT};
pub use genealogy::ProcessGenealogy;
pub use stats::{analyze_games, render_table, Leaderboard, LeaderboardRow, StatsAggregator};
