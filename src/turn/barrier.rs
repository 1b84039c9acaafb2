use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct BarrierConfig {
    /// Simultaneous-turn mode. When off the barrier never blocks.
    pub enabled: bool,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BarrierError {
    #[error("timed out after {waited:?} waiting for other agents to finish turn {turn}")]
    Timeout {
        agent: String,
        turn: u64,
        waited: Duration,
    },

    #[error("agent is not registered with the turn barrier")]
    UnknownAgent(String),
}

impl BarrierError {
    /// Timeouts are worth retrying; the caller's turn has been rolled back.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// How a completed move was let through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// Barrier off; nothing was counted.
    Disabled,
    Released {
        /// Global turn counter after release.
        turn: u64,
        /// This caller was the last to finish and closed the turn.
        closed_turn: bool,
        waited: Duration,
    },
}

/// Per-agent completed-turn counters and the global turn counter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TurnState {
    turn: u64,
    completed: BTreeMap<String, u64>,
}

impl TurnState {
    pub fn new<I, S>(agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            turn: 0,
            completed: agents.into_iter().map(|a| (a.into(), 0)).collect(),
        }
    }

    pub fn turn_count(&self) -> u64 {
        self.turn
    }

    pub fn completed(&self, agent: &str) -> Option<u64> {
        self.completed.get(agent).copied()
    }

    pub fn participants(&self) -> usize {
        self.completed.len()
    }

    fn record_completion(&mut self, agent: &str) -> Result<u64, BarrierError> {
        let count = self
            .completed
            .get_mut(agent)
            .ok_or_else(|| BarrierError::UnknownAgent(agent.to_string()))?;
        *count += 1;
        Ok(*count)
    }

    /// Evaluate the release condition for `agent`. `Some(true)` when this
    /// call closed the turn.
    fn try_release(&mut self, agent: &str) -> Option<bool> {
        let lowest = self.completed.values().copied().min()?;
        if lowest == self.turn + 1 {
            self.turn += 1;
            return Some(true);
        }
        if self.completed.get(agent).copied() == Some(self.turn) {
            return Some(false);
        }
        None
    }

    fn rollback(&mut self, agent: &str) {
        if let Some(count) = self.completed.get_mut(agent) {
            *count = count.saturating_sub(1);
        }
    }
}

/// Gate between an agent's generated move and its next request.
///
/// One instance per game, owned by the move-generation service and shared by
/// reference with every request handler. The lock guards counter updates only;
/// waiting happens outside it.
pub struct TurnBarrier {
    config: BarrierConfig,
    state: Mutex<TurnState>,
}

impl TurnBarrier {
    pub fn new<I, S>(config: BarrierConfig, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            config,
            state: Mutex::new(TurnState::new(agents)),
        }
    }

    pub fn disabled() -> Self {
        Self::new(BarrierConfig::default(), Vec::<String>::new())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &BarrierConfig {
        &self.config
    }

    pub fn turn_count(&self) -> u64 {
        self.lock().turn_count()
    }

    pub fn snapshot(&self) -> TurnState {
        self.lock().clone()
    }

    /// Count `agent`'s finished move and block until the turn lets it go.
    ///
    /// On timeout the increment is undone before the error is returned.
    pub fn complete_turn(&self, agent: &str) -> Result<BarrierOutcome, BarrierError> {
        if !self.config.enabled {
            return Ok(BarrierOutcome::Disabled);
        }

        let start = Instant::now();
        let count = self.lock().record_completion(agent)?;
        debug!("Agent completed move {}", count);

        loop {
            {
                let mut state = self.lock();
                if let Some(closed_turn) = state.try_release(agent) {
                    let turn = state.turn_count();
                    if closed_turn {
                        debug!("Turn {} closed", turn);
                    }
                    return Ok(BarrierOutcome::Released {
                        turn,
                        closed_turn,
                        waited: start.elapsed(),
                    });
                }
            }

            let waited = start.elapsed();
            if waited >= self.config.timeout {
                let mut state = self.lock();
                // A sibling may have closed the turn while we were asleep.
                if let Some(closed_turn) = state.try_release(agent) {
                    return Ok(BarrierOutcome::Released {
                        turn: state.turn_count(),
                        closed_turn,
                        waited,
                    });
                }
                state.rollback(agent);
                let turn = state.turn_count();
                drop(state);
                warn!("Turn barrier timed out after {:?} at turn {}", waited, turn);
                return Err(BarrierError::Timeout {
                    agent: agent.to_string(),
                    turn,
                    waited,
                });
            }

            let remaining = self.config.timeout - waited;
            thread::sleep(self.config.poll_interval.min(remaining));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TurnState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
