//! Multi-game aggregation and the leaderboard.

use crate::analysis::attribution::{attribute_game, AgentTally};
use crate::config::types::{ArenaError, EndReason, Result, EVENTS_FILE, RESULT_FILE};
use crate::game::result::GameResult;
use crate::trace::event::KernelEvent;
use crate::trace::log::EventLog;
use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Per-game log directory below a game directory.
pub const GAME_LOGS_DIR: &str = "root_logs";
pub const GAME_DIR_PREFIX: &str = "game_";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LeaderboardRow {
    pub agent: String,
    pub id: u32,
    pub survived: u32,
    pub killed: u32,
    pub self_kills: u32,
    pub killed_by_other: u32,
    pub kills: u32,
    pub tripwire_kills: u32,
    pub total_games: u32,
    /// Percentage, 0-100.
    pub survival_rate: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Leaderboard {
    pub rows: Vec<LeaderboardRow>,
    pub games_analyzed: usize,
}

/// Running totals keyed by (agent name, agent id). Tripwire agents are left out.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    totals: BTreeMap<(String, u32), (AgentTally, u32)>,
    games: usize,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attribute one game and fold it in. An inconsistent game is an error and
    /// leaves the totals untouched.
    pub fn add_game(&mut self, game: &str, result: &GameResult, events: &[KernelEvent]) -> Result<()> {
        let attribution = attribute_game(game, result, events)?;
        for agent in result.agents.iter().filter(|a| !a.is_tripwire) {
            let tally = attribution.tallies.get(&agent.id).copied().unwrap_or_default();
            let entry = self.totals.entry((agent.name.clone(), agent.id)).or_default();
            entry.0.absorb(&tally);
            entry.1 += 1;
        }
        self.games += 1;
        Ok(())
    }

    pub fn games(&self) -> usize {
        self.games
    }

    pub fn leaderboard(&self) -> Leaderboard {
        let mut rows: Vec<LeaderboardRow> = self
            .totals
            .iter()
            .map(|((name, id), (tally, games))| LeaderboardRow {
                agent: name.clone(),
                id: *id,
                survived: tally.survived,
                killed: tally.killed,
                self_kills: tally.self_killed,
                killed_by_other: tally.killed_by_other,
                kills: tally.kills,
                tripwire_kills: tally.tripwire_kills,
                total_games: *games,
                survival_rate: if *games == 0 {
                    0.0
                } else {
                    f64::from(tally.survived) * 100.0 / f64::from(*games)
                },
            })
            .collect();
        rows.sort_by(|a, b| {
            b.survival_rate
                .total_cmp(&a.survival_rate)
                .then_with(|| a.agent.cmp(&b.agent))
                .then_with(|| a.id.cmp(&b.id))
        });
        Leaderboard {
            rows,
            games_analyzed: self.games,
        }
    }
}

/// `game_*` directories under `games_dir`, sorted by name.
pub fn game_dirs(games_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(games_dir).map_err(|e| {
        ArenaError::Analysis(format!("cannot list {}: {}", games_dir.display(), e))
    })?;
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with(GAME_DIR_PREFIX))
        })
        .collect();
    dirs.sort();
    Ok(dirs)
}

/// Attribute and aggregate every finished game below `games_dir`.
pub fn analyze_games(games_dir: &Path) -> Result<Leaderboard> {
    let mut aggregator = StatsAggregator::new();
    for dir in game_dirs(games_dir)? {
        let logs = dir.join(GAME_LOGS_DIR);
        let result_path = logs.join(RESULT_FILE);
        let events_path = logs.join(EVENTS_FILE);
        if !result_path.is_file() || !events_path.is_file() {
            warn!("Skipping {}: missing {} or {}", dir.display(), RESULT_FILE, EVENTS_FILE);
            continue;
        }
        let result = GameResult::load(&result_path)?;
        if result.end_reason == Some(EndReason::Aborted) {
            warn!("Skipping aborted game {}", dir.display());
            continue;
        }
        let events = EventLog::load(&events_path)?;
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        aggregator.add_game(&name, &result, &events)?;
    }
    info!("Analyzed {} games", aggregator.games());
    Ok(aggregator.leaderboard())
}

const HEADERS: [&str; 10] = [
    "Agent",
    "ID",
    "Survived",
    "Killed",
    "Self Kills",
    "Killed by Other",
    "Kills",
    "Tripwire Kills",
    "Total Games",
    "Survival Rate",
];

/// ASCII grid followed by the number of games.
pub fn render_table(board: &Leaderboard) -> String {
    let cells: Vec<[String; 10]> = board
        .rows
        .iter()
        .map(|r| {
            [
                r.agent.clone(),
                r.id.to_string(),
                r.survived.to_string(),
                r.killed.to_string(),
                r.self_kills.to_string(),
                r.killed_by_other.to_string(),
                r.kills.to_string(),
                r.tripwire_kills.to_string(),
                r.total_games.to_string(),
                format!("{:.1}%", r.survival_rate),
            ]
        })
        .collect();

    let mut widths: Vec<usize> = HEADERS.iter().map(|h| h.len()).collect();
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let separator: String = widths
        .iter()
        .map(|w| format!("+{}", "-".repeat(w + 2)))
        .collect::<String>()
        + "+";
    let line = |values: &[String]| -> String {
        values
            .iter()
            .zip(widths.iter())
            .map(|(v, w)| format!("| {:<width$} ", v, width = *w))
            .collect::<String>()
            + "|"
    };

    let mut out = Vec::new();
    out.push(separator.clone());
    out.push(line(&HEADERS.map(String::from)));
    out.push(separator.clone());
    for row in &cells {
        out.push(line(row));
    }
    out.push(separator);
    out.push(String::new());
    out.push(format!("Total games analyzed: {}", board.games_analyzed));
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::result::AgentOutcome;

    fn game(killed: [bool; 2]) -> GameResult {
        GameResult {
            agents: vec![
                AgentOutcome {
                    id: 0,
                    name: "alpha".into(),
                    was_killed: killed[0],
                    pid: Some(100),
                    is_tripwire: false,
                },
                AgentOutcome {
                    id: 1,
                    name: "beta".into(),
                    was_killed: killed[1],
                    pid: Some(200),
                    is_tripwire: false,
                },
            ],
            end_reason: Some(EndReason::Elimination),
            duration_secs: 1.0,
        }
    }

    fn alpha_kills_beta() -> Vec<KernelEvent> {
        vec![
            KernelEvent::exec("t".into(), 101, 100, 1000, "sh"),
            KernelEvent::exec("t".into(), 201, 200, 1000, "sh"),
            KernelEvent::kill("t".into(), 101, 100, 1000, "sh", 201, Some(9)),
        ]
    }

    #[test]
    fn leaderboard_sorts_by_survival_rate() {
        let mut agg = StatsAggregator::new();
        agg.add_game("game_1", &game([false, true]), &alpha_kills_beta()).unwrap();
        agg.add_game("game_2", &game([false, false]), &[]).unwrap();
        let board = agg.leaderboard();
        assert_eq!(board.games_analyzed, 2);
        assert_eq!(board.rows[0].agent, "alpha");
        assert_eq!(board.rows[0].survival_rate, 100.0);
        assert_eq!(board.rows[0].kills, 1);
        assert_eq!(board.rows[1].survival_rate, 50.0);
        assert_eq!(board.rows[1].killed_by_other, 1);
    }

    #[test]
    fn inconsistent_game_is_not_counted() {
        let mut agg = StatsAggregator::new();
        assert!(agg.add_game("game_x", &game([false, true]), &[]).is_err());
        assert_eq!(agg.games(), 0);
        assert!(agg.leaderboard().rows.is_empty());
    }

    #[test]
    fn table_has_a_grid_and_a_total() {
        let mut agg = StatsAggregator::new();
        agg.add_game("game_1", &game([false, true]), &alpha_kills_beta()).unwrap();
        let table = render_table(&agg.leaderboard());
        let lines: Vec<&str> = table.lines().collect();
        assert!(lines[0].starts_with("+-"));
        assert!(lines[1].contains("| Survival Rate |"));
        assert!(lines[3].contains("100.0%"));
        assert!(lines[4].contains("0.0%"));
        assert_eq!(lines.last().copied(), Some("Total games analyzed: 1"));
        // All grid lines share one width.
        assert!(lines[..6].iter().all(|l| l.len() == lines[0].len()));
    }
}
