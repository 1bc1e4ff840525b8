//! League table.
//!
//! Only the scheduler writes to it, once per sealed match. Forfeits with no winner count as a
//! loss for both sides and award no points, so the total number of points never decreases.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::match_record::{MatchOutcome, MatchRecord};
use crate::registry::PeerId;

/// Points awarded per match result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsTable {
    /// Points for a win.
    pub win: u32,
    /// Points for a draw.
    pub draw: u32,
    /// Points for a loss.
    pub loss: u32,
}

impl Default for PointsTable {
    fn default() -> Self {
        Self {
            win: 3,
            draw: 1,
            loss: 0,
        }
    }
}

/// One row of the table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandingsEntry {
    /// Player.
    pub peer_id: PeerId,
    /// Matches won.
    pub wins: u32,
    /// Matches lost (no-contest forfeits included).
    pub losses: u32,
    /// Matches drawn.
    pub draws: u32,
    /// Total points.
    pub points: u32,
    /// Matches counted.
    pub matches_played: u32,
}

impl StandingsEntry {
    fn new(peer_id: &str) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            ..Default::default()
        }
    }
}

impl std::fmt::Display for StandingsEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} pts (win: {}, draw: {}, lose: {})",
            self.peer_id, self.points, self.wins, self.draws, self.losses
        )
    }
}

/// Running tally of match outcomes, used to check the table against the matches it counted.
///
/// A no contest (forfeit with no winner, e.g. both players silent or a round deadline) is a
/// loss for both players and awards no points. Across the table this gives:
///
/// - wins = `decisive`
/// - losses = `decisive + 2 * no_contest`
/// - draws = `2 * drawn`
/// - points = `decisive * (win + loss) + 2 * drawn * draw + 2 * no_contest * loss`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeTally {
    /// Matches with a winner.
    pub decisive: u32,
    /// Completed matches with no winner.
    pub drawn: u32,
    /// Forfeits with no winner.
    pub no_contest: u32,
}

impl OutcomeTally {
    /// Matches counted.
    pub fn total(&self) -> u32 {
        self.decisive + self.drawn + self.no_contest
    }

    /// Record one outcome.
    pub fn add(&mut self, outcome: &MatchOutcome) {
        match outcome {
            MatchOutcome::Decisive { .. } => self.decisive += 1,
            MatchOutcome::Draw => self.drawn += 1,
            MatchOutcome::NoContest => self.no_contest += 1,
        }
    }
}

/// The table itself.
#[derive(Debug, Clone, Default)]
pub struct Standings {
    points: PointsTable,
    entries: BTreeMap<PeerId, StandingsEntry>,
    tally: OutcomeTally,
}

impl Standings {
    /// Empty table.
    pub fn new(points: PointsTable) -> Self {
        Self {
            points,
            entries: BTreeMap::new(),
            tally: OutcomeTally::default(),
        }
    }

    /// Make sure a player has a row, even before its first match.
    pub fn add_player(&mut self, peer_id: &str) {
        self.entries
            .entry(peer_id.to_string())
            .or_insert_with(|| StandingsEntry::new(peer_id));
    }

    /// Count a sealed match. Returns false (and changes nothing) for a live match.
    pub fn record(&mut self, record: &MatchRecord) -> bool {
        let Some(outcome) = record.outcome() else {
            return false;
        };
        match &outcome {
            MatchOutcome::Decisive { winner, loser } => {
                self.apply(winner, |e, p| {
                    e.wins += 1;
                    e.points += p.win;
                });
                self.apply(loser, |e, p| {
                    e.losses += 1;
                    e.points += p.loss;
                });
            }
            MatchOutcome::Draw => {
                for peer in [&record.player_a_id, &record.player_b_id] {
                    self.apply(peer, |e, p| {
                        e.draws += 1;
                        e.points += p.draw;
                    });
                }
            }
            MatchOutcome::NoContest => {
                for peer in [&record.player_a_id, &record.player_b_id] {
                    self.apply(peer, |e, _| e.losses += 1);
                }
            }
        }
        self.tally.add(&outcome);
        debug!(match_id = %record.match_id, ?outcome, "standings updated");
        true
    }

    fn apply(&mut self, peer_id: &str, f: impl FnOnce(&mut StandingsEntry, &PointsTable)) {
        let entry = self
            .entries
            .entry(peer_id.to_string())
            .or_insert_with(|| StandingsEntry::new(peer_id));
        entry.matches_played += 1;
        f(entry, &self.points);
    }

    /// Rows sorted by points (descending), ties broken by peer id.
    pub fn sorted(&self) -> Vec<StandingsEntry> {
        let mut rows = self.entries.values().cloned().collect::<Vec<_>>();
        rows.sort_by(|a, b| b.points.cmp(&a.points).then_with(|| a.peer_id.cmp(&b.peer_id)));
        rows
    }

    /// Row of one player.
    pub fn get(&self, peer_id: &str) -> Option<&StandingsEntry> {
        self.entries.get(peer_id)
    }

    /// Sum of every player's points.
    pub fn total_points(&self) -> u32 {
        self.entries.values().map(|e| e.points).sum()
    }

    /// Outcomes counted so far.
    pub fn tally(&self) -> OutcomeTally {
        self.tally
    }

    /// Points table in use.
    pub fn points_table(&self) -> PointsTable {
        self.points
    }

    /// Whether wins, losses and draws add up to the matches counted.
    pub fn is_consistent(&self) -> bool {
        let wins: u32 = self.entries.values().map(|e| e.wins).sum();
        let losses: u32 = self.entries.values().map(|e| e.losses).sum();
        let draws: u32 = self.entries.values().map(|e| e.draws).sum();
        wins == self.tally.decisive
            && losses == self.tally.decisive + 2 * self.tally.no_contest
            && draws == 2 * self.tally.drawn
    }

    /// Rebuild a table from persisted rows.
    pub fn restore(points: PointsTable, rows: Vec<StandingsEntry>, tally: OutcomeTally) -> Self {
        Self {
            points,
            entries: rows.into_iter().map(|e| (e.peer_id.clone(), e)).collect(),
            tally,
        }
    }
}
