//! Win conditions as pure functions of a liveness snapshot.

use crate::config::types::{EndReason, GameType};
use std::collections::BTreeMap;
use std::time::Duration;

/// What the rules need to know about one agent at one instant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentStatus {
    pub id: u32,
    pub alive: bool,
    pub is_tripwire: bool,
    pub team: Option<String>,
}

/// Non-liveness inputs of one tick.
#[derive(Clone, Debug, Default)]
pub struct TickState {
    pub elapsed: Duration,
    pub timeout: Duration,
    /// Latest global turn counter, when known.
    pub turn: Option<u64>,
    pub max_turns: Option<u64>,
    pub interrupted: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WinCondition {
    /// First competitor down ends the game.
    Direct,
    /// As `Direct`; the protected agent's death is recorded but never ends it.
    Tripwire,
    /// Ends when every member of some team is down at once.
    Team,
}

impl From<GameType> for WinCondition {
    fn from(game_type: GameType) -> Self {
        match game_type {
            GameType::Direct => Self::Direct,
            GameType::Tripwire => Self::Tripwire,
            GameType::Team => Self::Team,
        }
    }
}

impl WinCondition {
    pub fn eliminated(&self, agents: &[AgentStatus]) -> bool {
        let mut competitors = agents.iter().filter(|a| !a.is_tripwire).peekable();
        match self {
            Self::Direct | Self::Tripwire => competitors.any(|a| !a.alive),
            Self::Team => {
                if competitors.peek().is_none() {
                    return false;
                }
                let mut teams: BTreeMap<String, bool> = BTreeMap::new();
                for agent in competitors {
                    // An unteamed competitor is a team of one.
                    let team = agent
                        .team
                        .clone()
                        .unwrap_or_else(|| format!("solo_{}", agent.id));
                    *teams.entry(team).or_insert(false) |= agent.alive;
                }
                teams.values().any(|any_alive| !any_alive)
            }
        }
    }

    /// Why the game should stop now, if it should.
    pub fn evaluate(&self, agents: &[AgentStatus], tick: &TickState) -> Option<EndReason> {
        if self.eliminated(agents) {
            return Some(EndReason::Elimination);
        }
        if tick.interrupted {
            return Some(EndReason::Interrupted);
        }
        if let (Some(turn), Some(max)) = (tick.turn, tick.max_turns) {
            if turn >= max {
                return Some(EndReason::TurnLimit);
            }
        }
        if tick.elapsed >= tick.timeout {
            return Some(EndReason::Timeout);
        }
        None
    }
}
