//! Traits a game and a player strategy must implement to take part in the league.
//!
//! The referee only ever touches the game through [`GameRule`]: a declared legal range, a
//! deterministic fallback move and a pure [`GameRule::resolve`] function. Players decide their
//! moves through a [`MoveStrategy`].

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A move on the wire.
pub type Move = i64;

/// Side of a player within a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// First player of the pairing.
    A,
    /// Second player of the pairing.
    B,
}

impl Side {
    /// The opposing side.
    pub fn other(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }

    /// Index into per-side arrays (`scores[2]`).
    pub fn index(self) -> usize {
        match self {
            Side::A => 0,
            Side::B => 1,
        }
    }
}

/// Outcome of one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundOutcome {
    /// Side A takes the round.
    AWins,
    /// Side B takes the round.
    BWins,
    /// Nobody takes the round.
    Draw,
}

impl RoundOutcome {
    /// Winning side, if any.
    pub fn winner(self) -> Option<Side> {
        match self {
            RoundOutcome::AWins => Some(Side::A),
            RoundOutcome::BWins => Some(Side::B),
            RoundOutcome::Draw => None,
        }
    }
}

/// The rules of the game played in every round.
///
/// This is the only game-specific code the referee runs.
pub trait GameRule: Send + Sync {
    /// Identifier sent to players in invitations and move requests.
    fn game_id(&self) -> &str;

    /// Declared set of legal moves.
    fn legal_moves(&self) -> RangeInclusive<Move>;

    /// Move substituted for a player that timed out or played an illegal move.
    ///
    /// Must be legal.
    fn fallback_move(&self) -> Move;

    /// Decide a round. Must be total and free of side effects.
    fn resolve(&self, move_a: Move, move_b: Move) -> RoundOutcome;

    /// Check a move against [`GameRule::legal_moves`].
    fn validate(&self, value: Move) -> Result<Move, ValidationError> {
        let range = self.legal_moves();
        if range.contains(&value) {
            Ok(value)
        } else {
            Err(ValidationError::OutOfRange {
                value,
                min: *range.start(),
                max: *range.end(),
            })
        }
    }
}

/// Odds-and-evens: both players show 1 to 5 fingers. Side A wins the round when the sum is
/// even, side B when it is odd.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParityGame;

impl GameRule for ParityGame {
    fn game_id(&self) -> &str {
        "even_odd"
    }

    fn legal_moves(&self) -> RangeInclusive<Move> {
        1..=5
    }

    fn fallback_move(&self) -> Move {
        1
    }

    fn resolve(&self, move_a: Move, move_b: Move) -> RoundOutcome {
        if (move_a.rem_euclid(2) + move_b.rem_euclid(2)) % 2 == 0 {
            RoundOutcome::AWins
        } else {
            RoundOutcome::BWins
        }
    }
}

/// What a player implements to choose its moves.
///
/// Implementations must answer within the round timeout; a late answer is treated by the
/// referee exactly like no answer.
pub trait MoveStrategy: Send + Sync {
    /// Choose the move for `round` (1-based) of the given game.
    ///
    /// `opponent_history` holds the opponent's moves in the earlier rounds, oldest first.
    fn decide(
        &self,
        game_id: &str,
        round: u32,
        side: Side,
        opponent_history: &[Move],
    ) -> anyhow::Result<Move>;
}

#[cfg(test)]
mod interface_tests {
    use super::*;

    #[test]
    fn parity_resolution() {
        let g = ParityGame;
        assert_eq!(g.resolve(1, 1), RoundOutcome::AWins);
        assert_eq!(g.resolve(2, 4), RoundOutcome::AWins);
        assert_eq!(g.resolve(1, 2), RoundOutcome::BWins);
        assert_eq!(g.resolve(5, 4), RoundOutcome::BWins);
    }

    #[test]
    fn parity_resolution_is_total() {
        let g = ParityGame;
        assert_eq!(g.resolve(Move::MAX, Move::MAX), RoundOutcome::AWins);
        assert_eq!(g.resolve(Move::MIN, -1), RoundOutcome::BWins);
    }

    #[test]
    fn validation_uses_declared_range() {
        let g = ParityGame;
        assert_eq!(g.validate(3), Ok(3));
        assert_eq!(
            g.validate(0),
            Err(ValidationError::OutOfRange {
                value: 0,
                min: 1,
                max: 5
            })
        );
        assert!(g.validate(6).is_err());
        assert!(g.validate(g.fallback_move()).is_ok());
    }

    #[test]
    fn sides() {
        assert_eq!(Side::A.other(), Side::B);
        assert_eq!(Side::B.index(), 1);
        assert_eq!(serde_json::to_string(&Side::A).unwrap(), "\"a\"");
        assert_eq!(RoundOutcome::Draw.winner(), None);
    }
}
