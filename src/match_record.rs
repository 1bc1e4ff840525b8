//! Records produced by the referee: one [`RoundResult`] per round, one [`MatchRecord`] per
//! match. A record is sealed (never mutated again) once its state is terminal.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

use crate::game_interface::{Move, RoundOutcome, Side};
use crate::registry::PeerId;

/// States of the referee match machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchState {
    /// Assigned, nothing sent yet.
    Created,
    /// Invitations in flight.
    InvitationsSent,
    /// Both players accepted.
    PlayersReady,
    /// Waiting for both moves of the current round.
    RoundActive,
    /// Moves collected, deciding the round.
    ResolvingRound,
    /// Played to the end (all rounds or majority).
    Completed,
    /// Ended early: no-show, ejection or deadline.
    Forfeited,
}

impl MatchState {
    /// Check if transition to another state is valid.
    pub fn can_transition_to(&self, to: &MatchState) -> bool {
        use MatchState::*;
        match (self, to) {
            (Created, InvitationsSent) => true,
            (InvitationsSent, PlayersReady) => true,
            (PlayersReady, RoundActive) => true,
            (RoundActive, ResolvingRound) => true,
            (ResolvingRound, RoundActive) => true,
            (ResolvingRound, Completed) => true,
            // any live state may forfeit
            (s, Forfeited) => !s.is_terminal(),
            _ => false,
        }
    }

    /// `Completed` and `Forfeited` are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MatchState::Completed | MatchState::Forfeited)
    }
}

/// Why a match ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Every scheduled round was played.
    AllRoundsPlayed,
    /// One side won a majority of the scheduled rounds.
    MajorityReached,
    /// A player did not accept the invitation.
    InvitationDeclined,
    /// A player was ejected by the detector.
    PeerEjected,
    /// A player never answered a move request.
    Unresponsive,
    /// The whole-match deadline elapsed.
    MatchDeadline,
    /// The scheduler's hard round deadline elapsed.
    RoundDeadline,
    /// Never started because a player was already ejected.
    Walkover,
}

/// One resolved round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundResult {
    /// 1-based round index.
    pub round_index: u32,
    /// Move used for side A (after fallback substitution).
    pub move_a: Move,
    /// Move used for side B (after fallback substitution).
    pub move_b: Move,
    /// Round outcome.
    pub outcome: RoundOutcome,
    /// Time side A took to answer.
    pub latency_a_ms: u64,
    /// Time side B took to answer.
    pub latency_b_ms: u64,
    /// Side A's move was replaced by the fallback.
    #[serde(default)]
    pub substituted_a: bool,
    /// Side B's move was replaced by the fallback.
    #[serde(default)]
    pub substituted_b: bool,
}

/// Result of a sealed match, from the standings' point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// One winner, one loser.
    Decisive {
        /// Winner.
        winner: PeerId,
        /// Loser.
        loser: PeerId,
    },
    /// Completed with equal round wins.
    Draw,
    /// Forfeited with no winner: both sides lose.
    NoContest,
}

/// A match between two players.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    /// Unique id.
    pub match_id: String,
    /// League round this match belongs to.
    pub round_number: u32,
    /// Side A.
    pub player_a_id: PeerId,
    /// Side B.
    pub player_b_id: PeerId,
    /// Referee slot running the match.
    pub referee_id: PeerId,
    /// Current state.
    pub state: MatchState,
    /// Scheduled number of rounds.
    pub total_rounds: u32,
    /// Rounds resolved so far.
    pub rounds_played: u32,
    /// Round wins of side A and side B.
    pub scores: [u32; 2],
    /// Resolved rounds, in order.
    pub history: Vec<RoundResult>,
    /// Winner once sealed, if any.
    pub winner: Option<PeerId>,
    /// Why the match ended, once sealed.
    pub termination: Option<TerminationReason>,
    /// Creation time.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Sealing time.
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

impl MatchRecord {
    /// Fresh record in `Created` state.
    pub fn new(
        round_number: u32,
        player_a_id: PeerId,
        player_b_id: PeerId,
        referee_id: PeerId,
        total_rounds: u32,
    ) -> Self {
        Self {
            match_id: Uuid::new_v4().to_string(),
            round_number,
            player_a_id,
            player_b_id,
            referee_id,
            state: MatchState::Created,
            total_rounds,
            rounds_played: 0,
            scores: [0, 0],
            history: vec![],
            winner: None,
            termination: None,
            created_at: OffsetDateTime::now_utc(),
            completed_at: None,
        }
    }

    /// A match that never started because of an ejected player.
    pub fn walkover(
        round_number: u32,
        player_a_id: PeerId,
        player_b_id: PeerId,
        referee_id: PeerId,
        total_rounds: u32,
        winner: Option<Side>,
    ) -> Self {
        let mut record = Self::new(round_number, player_a_id, player_b_id, referee_id, total_rounds);
        record.seal(MatchState::Forfeited, winner, TerminationReason::Walkover);
        record
    }

    /// Terminal state reached; the record will not change anymore.
    pub fn is_sealed(&self) -> bool {
        self.state.is_terminal()
    }

    /// Player on a side.
    pub fn peer(&self, side: Side) -> &PeerId {
        match side {
            Side::A => &self.player_a_id,
            Side::B => &self.player_b_id,
        }
    }

    /// Side a player is on.
    pub fn side_of(&self, peer: &str) -> Option<Side> {
        if self.player_a_id == peer {
            Some(Side::A)
        } else if self.player_b_id == peer {
            Some(Side::B)
        } else {
            None
        }
    }

    /// Side currently ahead on round wins.
    pub fn leader(&self) -> Option<Side> {
        match self.scores[0].cmp(&self.scores[1]) {
            std::cmp::Ordering::Greater => Some(Side::A),
            std::cmp::Ordering::Less => Some(Side::B),
            std::cmp::Ordering::Equal => None,
        }
    }

    /// Opponent moves seen by `side` so far, oldest first.
    pub fn opponent_history(&self, side: Side) -> Vec<Move> {
        self.history
            .iter()
            .map(|r| match side {
                Side::A => r.move_b,
                Side::B => r.move_a,
            })
            .collect()
    }

    /// Standings view of a sealed record.
    pub fn outcome(&self) -> Option<MatchOutcome> {
        if !self.is_sealed() {
            return None;
        }
        let outcome = match &self.winner {
            Some(winner) => {
                let loser = if winner == &self.player_a_id {
                    self.player_b_id.clone()
                } else {
                    self.player_a_id.clone()
                };
                MatchOutcome::Decisive {
                    winner: winner.clone(),
                    loser,
                }
            }
            None if self.state == MatchState::Completed => MatchOutcome::Draw,
            None => MatchOutcome::NoContest,
        };
        Some(outcome)
    }

    pub(crate) fn transition(&mut self, to: MatchState) {
        if !self.state.can_transition_to(&to) {
            warn!(match_id = %self.match_id, from = ?self.state, ?to, "invalid match state transition ignored");
            return;
        }
        self.state = to;
    }

    pub(crate) fn push_round(&mut self, round: RoundResult) {
        if let Some(side) = round.outcome.winner() {
            self.scores[side.index()] += 1;
        }
        self.rounds_played += 1;
        self.history.push(round);
    }

    pub(crate) fn seal(&mut self, state: MatchState, winner: Option<Side>, reason: TerminationReason) {
        if self.is_sealed() {
            return;
        }
        self.transition(state);
        self.winner = winner.map(|side| self.peer(side).clone());
        self.termination = Some(reason);
        self.completed_at = Some(OffsetDateTime::now_utc());
    }
}

impl Display for MatchRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{} VS {}]", self.player_a_id, self.player_b_id)
    }
}
