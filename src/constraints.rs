//! Timing limits and the concurrency cap of a league run.
//!
//! Every wait in the league is bounded by one of these values, and each has a defined
//! fallback when it elapses:
//!
//! - **Registration timeout**: how long the manager waits for players; the league starts with
//!   whoever registered.
//! - **Invitation timeout**: how long a player has to accept a match; a non-acceptance forfeits.
//! - **Move timeout**: how long a player has to answer a move request; the fallback move is
//!   used instead.
//! - **Match deadline**: whole-match bound; the match is forfeited when it elapses. Derived from
//!   the other timeouts when not set.
//! - **Round deadline**: hard bound on a league round; matches still running are
//!   force-forfeited.
//!
//! The referee slot count caps how many matches run at the same time.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use agent_league::constraints::ConstraintsBuilder;
//!
//! let constraints = ConstraintsBuilder::new()
//!     .with_move_timeout(Duration::from_millis(500))
//!     .with_invitation_timeout(Duration::from_secs(2))
//!     .with_referee_slots(8)
//!     .build()
//!     .unwrap();
//! assert_eq!(constraints.referee_slots(), 8);
//! ```
//!
//! You may also construct constraints from environment variables using
//! [`ConstraintsBuilder::from_env()`] for runtime configurability.

use std::{env, time::Duration};

use anyhow::bail;

/// Extra time granted to a match on top of its invitation and move timeouts.
pub const MATCH_OVERHEAD: Duration = Duration::from_secs(2);

/// A builder for the league's timeouts and concurrency cap.
///
/// Unset values use the defaults listed on each method.
#[derive(Debug, Default, Clone)]
pub struct ConstraintsBuilder {
    registration_timeout: Option<Duration>,
    invitation_timeout: Option<Duration>,
    move_timeout: Option<Duration>,
    match_deadline: Option<Duration>,
    round_deadline: Option<Duration>,
    rpc_timeout: Option<Duration>,
    referee_slots: Option<usize>,
}

impl ConstraintsBuilder {
    /// Creates a new `ConstraintsBuilder` with every value at its default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new `ConstraintsBuilder` configured from environment variables.
    ///
    /// Read environment variables are:
    /// - `LEAGUE_REGISTRATION_TIMEOUT_MS` (u64)
    /// - `LEAGUE_INVITATION_TIMEOUT_MS` (u64)
    /// - `LEAGUE_MOVE_TIMEOUT_MS` (u64)
    /// - `LEAGUE_MATCH_DEADLINE_SECS` (u64)
    /// - `LEAGUE_ROUND_DEADLINE_SECS` (u64)
    /// - `LEAGUE_RPC_TIMEOUT_MS` (u64)
    /// - `LEAGUE_REFEREE_SLOTS` (usize)
    #[must_use]
    pub fn from_env() -> Self {
        fn parse_usize(var: &str) -> Option<usize> {
            env::var(var).ok()?.parse().ok()
        }

        fn parse_duration_secs(var: &str) -> Option<Duration> {
            env::var(var)
                .ok()?
                .parse::<u64>()
                .ok()
                .map(Duration::from_secs)
        }

        fn parse_duration_millis(var: &str) -> Option<Duration> {
            env::var(var)
                .ok()?
                .parse::<u64>()
                .ok()
                .map(Duration::from_millis)
        }

        ConstraintsBuilder {
            registration_timeout: parse_duration_millis("LEAGUE_REGISTRATION_TIMEOUT_MS"),
            invitation_timeout: parse_duration_millis("LEAGUE_INVITATION_TIMEOUT_MS"),
            move_timeout: parse_duration_millis("LEAGUE_MOVE_TIMEOUT_MS"),
            match_deadline: parse_duration_secs("LEAGUE_MATCH_DEADLINE_SECS"),
            round_deadline: parse_duration_secs("LEAGUE_ROUND_DEADLINE_SECS"),
            rpc_timeout: parse_duration_millis("LEAGUE_RPC_TIMEOUT_MS"),
            referee_slots: parse_usize("LEAGUE_REFEREE_SLOTS"),
        }
    }

    /// How long the manager waits for players to register. Default 60 s.
    #[must_use]
    pub fn with_registration_timeout(self, duration: Duration) -> Self {
        Self {
            registration_timeout: Some(duration),
            ..self
        }
    }

    /// How long a player has to accept an invitation. Default 5 s.
    #[must_use]
    pub fn with_invitation_timeout(self, duration: Duration) -> Self {
        Self {
            invitation_timeout: Some(duration),
            ..self
        }
    }

    /// How long a player has to answer a move request. Default 30 s.
    ///
    /// Answers slower than this also count as a timeout for the misbehaviour detector.
    #[must_use]
    pub fn with_move_timeout(self, duration: Duration) -> Self {
        Self {
            move_timeout: Some(duration),
            ..self
        }
    }

    /// Whole-match bound. Default: invitation timeout, plus one move timeout per round, plus
    /// [`MATCH_OVERHEAD`].
    #[must_use]
    pub fn with_match_deadline(self, duration: Duration) -> Self {
        Self {
            match_deadline: Some(duration),
            ..self
        }
    }

    /// Hard bound on a league round. Default 10 min.
    #[must_use]
    pub fn with_round_deadline(self, duration: Duration) -> Self {
        Self {
            round_deadline: Some(duration),
            ..self
        }
    }

    /// Budget of bookkeeping calls (health checks, result reports, registration). Default 2 s.
    #[must_use]
    pub fn with_rpc_timeout(self, duration: Duration) -> Self {
        Self {
            rpc_timeout: Some(duration),
            ..self
        }
    }

    /// Number of matches allowed to run at the same time. Default 50.
    #[must_use]
    pub fn with_referee_slots(self, slots: usize) -> Self {
        Self {
            referee_slots: Some(slots),
            ..self
        }
    }

    /// Consumes the builder and returns the constructed `Constraints`.
    ///
    /// # Errors
    ///
    /// Returns an error when the constraints are impossible, e.g. a zero timeout, no referee
    /// slot, or a match deadline shorter than a single move.
    pub fn build(self) -> anyhow::Result<Constraints> {
        let defaults = Constraints::default();
        let constraints = Constraints {
            registration_timeout: self
                .registration_timeout
                .unwrap_or(defaults.registration_timeout),
            invitation_timeout: self.invitation_timeout.unwrap_or(defaults.invitation_timeout),
            move_timeout: self.move_timeout.unwrap_or(defaults.move_timeout),
            match_deadline: self.match_deadline,
            round_deadline: self.round_deadline.unwrap_or(defaults.round_deadline),
            rpc_timeout: self.rpc_timeout.unwrap_or(defaults.rpc_timeout),
            referee_slots: self.referee_slots.unwrap_or(defaults.referee_slots),
        };

        if constraints.referee_slots == 0 {
            bail!("At least one referee slot is required");
        }
        for (name, value) in [
            ("invitation timeout", constraints.invitation_timeout),
            ("move timeout", constraints.move_timeout),
            ("round deadline", constraints.round_deadline),
            ("rpc timeout", constraints.rpc_timeout),
        ] {
            if value.is_zero() {
                bail!("The {name} must be greater than zero");
            }
        }
        if constraints.round_deadline < constraints.move_timeout {
            bail!(
                "Round deadline ({:?}) is shorter than the move timeout ({:?})",
                constraints.round_deadline,
                constraints.move_timeout
            );
        }
        if let Some(deadline) = constraints.match_deadline {
            if deadline < constraints.move_timeout {
                bail!(
                    "Match deadline ({deadline:?}) is shorter than the move timeout ({:?})",
                    constraints.move_timeout
                );
            }
        }

        Ok(constraints)
    }
}

/// Obtained using `ConstraintsBuilder`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Constraints {
    pub(crate) registration_timeout: Duration,
    pub(crate) invitation_timeout: Duration,
    pub(crate) move_timeout: Duration,
    pub(crate) match_deadline: Option<Duration>,
    pub(crate) round_deadline: Duration,
    pub(crate) rpc_timeout: Duration,
    pub(crate) referee_slots: usize,
}

impl Constraints {
    /// create a ConstraintsBuilder
    pub fn builder() -> ConstraintsBuilder {
        ConstraintsBuilder::new()
    }

    /// Registration window.
    pub fn registration_timeout(&self) -> Duration {
        self.registration_timeout
    }

    /// Invitation acceptance window.
    pub fn invitation_timeout(&self) -> Duration {
        self.invitation_timeout
    }

    /// Per-move answer window.
    pub fn move_timeout(&self) -> Duration {
        self.move_timeout
    }

    /// Hard bound on a league round.
    pub fn round_deadline(&self) -> Duration {
        self.round_deadline
    }

    /// Budget of bookkeeping calls.
    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    /// Concurrency cap.
    pub fn referee_slots(&self) -> usize {
        self.referee_slots
    }

    /// Whole-match bound for a match of `total_rounds` rounds.
    pub fn match_deadline(&self, total_rounds: u32) -> Duration {
        self.match_deadline.unwrap_or_else(|| {
            self.invitation_timeout
                .saturating_add(self.move_timeout.saturating_mul(total_rounds))
                .saturating_add(MATCH_OVERHEAD)
        })
    }
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            registration_timeout: Duration::from_secs(60),
            invitation_timeout: Duration::from_secs(5),
            move_timeout: Duration::from_secs(30),
            match_deadline: None,
            round_deadline: Duration::from_secs(600),
            rpc_timeout: Duration::from_secs(2),
            referee_slots: 50,
        }
    }
}
