//! Offline kill attribution for one game.
//!
//! The controller decides who died from liveness polling; this module decides
//! who did it from the event log. The two must agree on who died, and a
//! disagreement is an error rather than something to reconcile.

use crate::analysis::genealogy::ProcessGenealogy;
use crate::config::types::{ArenaError, Result};
use crate::game::result::GameResult;
use crate::trace::event::KernelEvent;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Genealogy entries whose death eliminates the agent, counted after the
/// privilege-switch wrapper: the shell su starts and the interpreter it runs.
///
/// The wrapper itself is root-owned. Agents cannot signal it, so a kill aimed
/// at its pid fails in the kernel but is still traced; only a group kill
/// addressed to it (the agent's process group) reaches the agent.
pub const FATAL_PIDS_PER_AGENT: usize = 2;

/// Per-agent counts for one or more games.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentTally {
    pub survived: u32,
    pub killed: u32,
    pub self_killed: u32,
    pub killed_by_other: u32,
    pub kills: u32,
    pub tripwire_kills: u32,
}

impl AgentTally {
    pub fn absorb(&mut self, other: &AgentTally) {
        self.survived += other.survived;
        self.killed += other.killed;
        self.self_killed += other.self_killed;
        self.killed_by_other += other.killed_by_other;
        self.kills += other.kills;
        self.tripwire_kills += other.tripwire_kills;
    }
}

/// The kill event blamed for an agent's death.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AttributedKill {
    pub victim: u32,
    pub target_pid: u32,
    pub sender_pid: u32,
    /// Agent owning the sender pid; `None` when it belongs to no genealogy.
    pub killer: Option<u32>,
    pub timestamp: String,
}

impl AttributedKill {
    pub fn is_self_kill(&self) -> bool {
        self.killer == Some(self.victim)
    }
}

#[derive(Clone, Debug)]
pub struct GameAttribution {
    pub game: String,
    pub genealogy: ProcessGenealogy,
    pub kills: Vec<AttributedKill>,
    pub tallies: BTreeMap<u32, AgentTally>,
}

pub fn fatal_pids(genealogy: &ProcessGenealogy, agent: u32) -> &[u32] {
    let own = genealogy.pids(agent).get(1..).unwrap_or(&[]);
    &own[..own.len().min(FATAL_PIDS_PER_AGENT)]
}

/// First kill in log order aimed at one of `fatal`, or at the process group
/// led by `group`. Existence probes never count.
fn first_fatal_kill<'a>(
    events: &'a [KernelEvent],
    group: Option<u32>,
    fatal: &[u32],
) -> Option<&'a KernelEvent> {
    events.iter().find(|event| {
        if event.is_existence_probe() {
            return false;
        }
        match event.kill_target() {
            Some(target) => {
                fatal.contains(&target) || (event.is_group_kill() && group == Some(target))
            }
            None => false,
        }
    })
}

/// Attribute every death in `result` using `events`.
pub fn attribute_game(game: &str, result: &GameResult, events: &[KernelEvent]) -> Result<GameAttribution> {
    let roots: Vec<(u32, u32)> = result
        .agents
        .iter()
        .filter_map(|a| a.pid.map(|pid| (a.id, pid)))
        .collect();
    let genealogy = ProcessGenealogy::build(&roots, events);

    let mut tallies: BTreeMap<u32, AgentTally> =
        result.agents.iter().map(|a| (a.id, AgentTally::default())).collect();
    let mut kills = Vec::new();

    for agent in &result.agents {
        if agent.pid.is_none() {
            // Never started: nothing to attribute, and it can only have lost.
            if !agent.was_killed {
                return Err(inconsistent(game, agent.id, &agent.name, false, false));
            }
            bump(&mut tallies, agent.id, |t| t.killed += 1);
            continue;
        }

        let fatal = fatal_pids(&genealogy, agent.id);
        let found = first_fatal_kill(events, agent.pid, fatal);
        if found.is_some() != agent.was_killed {
            return Err(inconsistent(
                game,
                agent.id,
                &agent.name,
                agent.was_killed,
                found.is_some(),
            ));
        }

        let Some(event) = found else {
            bump(&mut tallies, agent.id, |t| t.survived += 1);
            continue;
        };

        let kill = AttributedKill {
            victim: agent.id,
            target_pid: event.kill_target().unwrap_or_default(),
            sender_pid: event.pid,
            killer: genealogy.owner_of(event.pid),
            timestamp: event.timestamp.clone(),
        };
        debug!(
            "{}: agent {} killed via pid {} by pid {} (agent {:?})",
            game, agent.id, kill.target_pid, kill.sender_pid, kill.killer
        );

        bump(&mut tallies, agent.id, |t| t.killed += 1);
        match kill.killer {
            Some(killer) if killer == agent.id => bump(&mut tallies, agent.id, |t| t.self_killed += 1),
            Some(killer) => {
                bump(&mut tallies, agent.id, |t| t.killed_by_other += 1);
                if agent.is_tripwire {
                    bump(&mut tallies, killer, |t| t.tripwire_kills += 1);
                } else {
                    bump(&mut tallies, killer, |t| t.kills += 1);
                }
            }
            None => {}
        }
        kills.push(kill);
    }

    Ok(GameAttribution {
        game: game.to_string(),
        genealogy,
        kills,
        tallies,
    })
}

fn bump<F>(tallies: &mut BTreeMap<u32, AgentTally>, agent: u32, f: F)
where
    F: FnOnce(&mut AgentTally),
{
    f(tallies.entry(agent).or_default());
}

fn inconsistent(game: &str, agent_id: u32, name: &str, was_killed: bool, attributed: bool) -> ArenaError {
    let err = ArenaError::Inconsistent {
        game: game.to_string(),
        agent_id,
        name: name.to_string(),
        was_killed,
        attributed,
    };
    error!("{}", err);
    err
}
