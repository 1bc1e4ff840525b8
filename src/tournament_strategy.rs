//! Tournament strategies used by the league to schedule pairings.
//!
//! This module defines the [`TournamentStrategy`] trait and the round-robin strategy the league
//! uses by default. A strategy only decides who plays whom in which round; playing the matches
//! and scoring them is the job of the
//! [`LeagueScheduler`](crate::tournament_scheduler::LeagueScheduler).
//!
//! # Implementing a Custom Strategy
//! Implement [`TournamentStrategy::schedule`]. Every returned round must pair each player at
//! most once, and rounds must be numbered from 1 without gaps.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::registry::PeerId;

/// Two players meeting in a round. `player_a` plays side A.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pairing {
    /// Side A.
    pub player_a: PeerId,
    /// Side B.
    pub player_b: PeerId,
}

impl std::fmt::Display for Pairing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{} VS {}]", self.player_a, self.player_b)
    }
}

/// Pairings of one league round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledRound {
    /// 1-based.
    pub round_number: u32,
    /// Matches of the round.
    pub pairings: Vec<Pairing>,
    /// Player sitting this round out (odd number of players).
    pub bye: Option<PeerId>,
}

/// A trait defining how players are grouped into rounds.
pub trait TournamentStrategy: Send + Sync {
    /// All rounds for `players`, in order.
    fn schedule(&self, players: &[PeerId]) -> Vec<ScheduledRound>;
}

/// A round-robin tournament where each player meets every other player, generated with the
/// circle method.
///
/// With `n` players the schedule has `n - 1` rounds when `n` is even and `n` rounds when it is
/// odd, in which case every player gets exactly one bye. If `symmetric` is false, a second
/// cycle is appended with sides swapped, so that each pair is evaluated in both directions.
#[derive(Debug, Clone, Copy)]
pub struct RoundRobinTournament {
    symmetric: bool,
}

impl RoundRobinTournament {
    /// Creates a new Round Robin tournament.
    ///
    /// Set `symmetric = true` if A vs B is equivalent to B vs A.
    pub fn new(symmetric: bool) -> Self {
        Self { symmetric }
    }
}

impl Default for RoundRobinTournament {
    fn default() -> Self {
        Self::new(true)
    }
}

impl TournamentStrategy for RoundRobinTournament {
    fn schedule(&self, players: &[PeerId]) -> Vec<ScheduledRound> {
        let mut players = players.to_vec();
        players.sort();
        players.dedup();
        if players.len() < 2 {
            return vec![];
        }

        // None is the bye slot
        let mut circle: Vec<Option<PeerId>> = players.into_iter().map(Some).collect();
        if circle.len() % 2 == 1 {
            circle.push(None);
        }
        let n = circle.len();

        let mut rounds = Vec::with_capacity(n - 1);
        for r in 0..n - 1 {
            let mut pairings = vec![];
            let mut bye = None;
            for i in 0..n / 2 {
                let (mut a, mut b) = (circle[i].clone(), circle[n - 1 - i].clone());
                // alternate sides of the fixed player so nobody is always side A
                if i == 0 && r % 2 == 1 {
                    std::mem::swap(&mut a, &mut b);
                }
                match (a, b) {
                    (Some(player_a), Some(player_b)) => pairings.push(Pairing { player_a, player_b }),
                    (Some(p), None) | (None, Some(p)) => bye = Some(p),
                    (None, None) => {}
                }
            }
            rounds.push(ScheduledRound {
                round_number: r as u32 + 1,
                pairings,
                bye,
            });
            // keep the first seat, rotate the others clockwise
            circle[1..].rotate_right(1);
        }

        if !self.symmetric {
            let first_cycle = rounds.len() as u32;
            let swapped: Vec<_> = rounds
                .iter()
                .map(|round| ScheduledRound {
                    round_number: round.round_number + first_cycle,
                    pairings: round
                        .pairings
                        .iter()
                        .map(|p| Pairing {
                            player_a: p.player_b.clone(),
                            player_b: p.player_a.clone(),
                        })
                        .collect(),
                    bye: round.bye.clone(),
                })
                .collect();
            rounds.extend(swapped);
        }

        info!(
            players = n,
            rounds = rounds.len(),
            matches = rounds.iter().map(|r| r.pairings.len()).sum::<usize>(),
            "round robin schedule generated"
        );
        rounds
    }
}

#[cfg(test)]
mod tournament_strategy_tests {
    use std::collections::{HashMap, HashSet};

    use super::*;

    fn players(n: usize) -> Vec<PeerId> {
        (1..=n).map(|i| format!("P{i:04}")).collect()
    }

    fn unordered(p: &Pairing) -> (PeerId, PeerId) {
        if p.player_a < p.player_b {
            (p.player_a.clone(), p.player_b.clone())
        } else {
            (p.player_b.clone(), p.player_a.clone())
        }
    }

    fn check_complete(n: usize) {
        let ids = players(n);
        let rounds = RoundRobinTournament::new(true).schedule(&ids);
        let expected_rounds = if n % 2 == 0 { n - 1 } else { n };
        assert_eq!(rounds.len(), expected_rounds, "n = {n}");

        let mut seen = HashSet::new();
        let mut byes: HashMap<PeerId, usize> = HashMap::new();
        for (i, round) in rounds.iter().enumerate() {
            assert_eq!(round.round_number, i as u32 + 1);
            let mut busy = HashSet::new();
            for p in &round.pairings {
                assert_ne!(p.player_a, p.player_b);
                assert!(busy.insert(p.player_a.clone()), "double booked in round {}", i + 1);
                assert!(busy.insert(p.player_b.clone()), "double booked in round {}", i + 1);
                assert!(seen.insert(unordered(p)), "pair {p} scheduled twice");
            }
            if let Some(bye) = &round.bye {
                assert!(!busy.contains(bye));
                *byes.entry(bye.clone()).or_default() += 1;
            }
        }
        assert_eq!(seen.len(), n * (n - 1) / 2);
        if n % 2 == 1 {
            assert_eq!(byes.len(), n);
            assert!(byes.values().all(|count| *count == 1));
        } else {
            assert!(byes.is_empty());
        }
    }

    #[test]
    fn every_pair_meets_exactly_once() {
        for n in 2..=12 {
            check_complete(n);
        }
    }

    #[test]
    fn four_players() {
        let rounds = RoundRobinTournament::default().schedule(&players(4));
        assert_eq!(rounds.len(), 3);
        assert!(rounds.iter().all(|r| r.pairings.len() == 2 && r.bye.is_none()));
    }

    #[test]
    fn asymmetric_plays_both_sides() {
        let rounds = RoundRobinTournament::new(false).schedule(&players(3));
        assert_eq!(rounds.len(), 6);
        let ordered: HashSet<_> = rounds
            .iter()
            .flat_map(|r| r.pairings.iter())
            .map(|p| (p.player_a.clone(), p.player_b.clone()))
            .collect();
        assert_eq!(ordered.len(), 6);
    }

    #[test]
    fn too_few_players() {
        assert!(RoundRobinTournament::default().schedule(&[]).is_empty());
        assert!(RoundRobinTournament::default()
            .schedule(&["P0001".to_string(), "P0001".to_string()])
            .is_empty());
    }
}
