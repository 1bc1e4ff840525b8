//! Referee: runs one match between two players, from invitations to the sealed record.
//!
//! A [`MatchMachine`] walks the [`MatchState`] graph:
//!
//! ```text
//! Created -> InvitationsSent -> PlayersReady -> RoundActive <-> ResolvingRound -> Completed
//!     \______________\_______________\______________\_______________\-----------> Forfeited
//! ```
//!
//! Every call to a player goes through the shared [`Transport`] and is bounded by a timeout,
//! and the whole match is bounded by [`Constraints::match_deadline`], so [`MatchMachine::run`]
//! always returns a sealed record.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::constraints::Constraints;
use crate::detector::{ByzantineDetector, OutcomeKind};
use crate::error::{AssignmentError, ValidationError};
use crate::events::EventSink;
use crate::game_interface::{GameRule, Move, Side};
use crate::match_record::{MatchRecord, MatchState, RoundResult, TerminationReason};
use crate::protocol::{
    decode_params, encode, InviteMatchParams, InviteMatchResult, Method, ReportResultParams,
    RequestMoveParams, RequestMoveResult,
};
use crate::registry::{PeerRecord, PeerStatus, Registry, Role};
use crate::transport::{Reply, Transport};

/// When an ejection detected mid-match takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EjectionPolicy {
    /// The current round is finished, the match is forfeited before the next one.
    #[default]
    RoundBoundary,
    /// The match is forfeited as soon as the moves of the current round are in, without
    /// recording that round.
    Immediate,
}

/// Everything a referee needs, shared by all matches of a league.
pub struct RefereeContext {
    /// Shared transport, observed by `detector`.
    pub transport: Arc<Transport>,
    /// Players are looked up and their status updated here.
    pub registry: Arc<Registry>,
    /// Consulted for ejections.
    pub detector: Arc<ByzantineDetector>,
    /// Receives `match.started` and `round.completed`.
    pub events: Arc<dyn EventSink>,
    /// Game played.
    pub game: Arc<dyn GameRule>,
    /// Timeouts.
    pub constraints: Constraints,
    /// When a mid-match ejection ends the match.
    pub ejection_policy: EjectionPolicy,
}

enum Invitation {
    Accepted,
    Declined,
    NoResponse,
}

struct CollectedMove {
    value: Move,
    latency_ms: u64,
    substituted: bool,
    /// The player sent something back, valid or not.
    responded: bool,
}

/// One match, owned by the task running it.
pub struct MatchMachine {
    ctx: Arc<RefereeContext>,
    record: MatchRecord,
    players: [PeerRecord; 2],
    responded: [bool; 2],
    cancel: Option<watch::Receiver<bool>>,
}

impl MatchMachine {
    /// Check the pairing and create the match in `Created` state.
    pub fn assign(
        ctx: Arc<RefereeContext>,
        round_number: u32,
        player_a_id: &str,
        player_b_id: &str,
        referee_id: &str,
        total_rounds: u32,
    ) -> Result<Self, AssignmentError> {
        if total_rounds == 0 {
            return Err(AssignmentError::NoRounds);
        }
        if player_a_id == player_b_id {
            return Err(AssignmentError::SelfMatch(player_a_id.to_string()));
        }
        let lookup = |id: &str| -> Result<PeerRecord, AssignmentError> {
            let peer = ctx
                .registry
                .get(id)
                .filter(|p| p.role == Role::Player)
                .ok_or_else(|| AssignmentError::UnknownPeer(id.to_string()))?;
            if peer.is_ejected() || ctx.detector.is_ejected(id) {
                return Err(AssignmentError::PeerEjected(id.to_string()));
            }
            Ok(peer)
        };
        let a = lookup(player_a_id)?;
        let b = lookup(player_b_id)?;
        let record = MatchRecord::new(
            round_number,
            a.id.clone(),
            b.id.clone(),
            referee_id.to_string(),
            total_rounds,
        );
        Ok(Self {
            ctx,
            record,
            players: [a, b],
            responded: [false, false],
            cancel: None,
        })
    }

    /// Forfeit the match as soon as `cancel` turns true.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// The record as assigned.
    pub fn record(&self) -> &MatchRecord {
        &self.record
    }

    /// Seal a match that never started because its round was cancelled. Players are not
    /// contacted and their status is left untouched.
    pub fn abandon(mut self) -> MatchRecord {
        warn!(match_id = %self.record.match_id, pairing = %self.record, "match cancelled before it started");
        self.record
            .seal(MatchState::Forfeited, None, TerminationReason::RoundDeadline);
        self.record
    }

    /// Drive the match to a terminal state and report the result to both players.
    #[instrument(skip_all, fields(match_id = %self.record.match_id, pairing = %self.record))]
    pub async fn run(mut self) -> MatchRecord {
        let deadline = self
            .ctx
            .constraints
            .match_deadline(self.record.total_rounds);
        let cancel = self.cancel.take();

        let interrupted = tokio::select! {
            _ = self.lifecycle() => None,
            _ = tokio::time::sleep(deadline) => Some(TerminationReason::MatchDeadline),
            _ = cancelled(cancel) => Some(TerminationReason::RoundDeadline),
        };
        if let Some(reason) = interrupted {
            if !self.record.is_sealed() {
                warn!(?reason, rounds_played = self.record.rounds_played, "match interrupted");
                let leader = self.record.leader();
                self.record.seal(MatchState::Forfeited, leader, reason);
            }
        }

        self.release();
        self.report().await;
        info!(
            state = ?self.record.state,
            winner = ?self.record.winner,
            scores = ?self.record.scores,
            reason = ?self.record.termination,
            "match over"
        );
        self.record
    }

    fn peer(&self, side: Side) -> &PeerRecord {
        &self.players[side.index()]
    }

    fn is_ejected(&self, side: Side) -> bool {
        self.ctx.detector.is_ejected(&self.peer(side).id)
    }

    async fn lifecycle(&mut self) {
        self.record.transition(MatchState::InvitationsSent);
        for side in [Side::A, Side::B] {
            let id = self.peer(side).id.clone();
            self.ctx.registry.set_status(&id, PeerStatus::Busy);
        }

        let (a, b) = futures::join!(self.invite(Side::A), self.invite(Side::B));
        match (a, b) {
            (Invitation::Accepted, Invitation::Accepted) => {}
            (a, b) => {
                let winner = match (a, b) {
                    (Invitation::Accepted, _) => Some(Side::A),
                    (_, Invitation::Accepted) => Some(Side::B),
                    _ => None,
                };
                self.record
                    .seal(MatchState::Forfeited, winner, TerminationReason::InvitationDeclined);
                return;
            }
        }
        self.record.transition(MatchState::PlayersReady);
        self.ctx.events.match_started(&self.record);

        let total = self.record.total_rounds;
        let majority = total.div_ceil(2);
        for round in 1..=total {
            self.record.transition(MatchState::RoundActive);
            let (move_a, move_b) =
                futures::join!(self.collect_move(Side::A, round), self.collect_move(Side::B, round));

            if self.ctx.ejection_policy == EjectionPolicy::Immediate && self.forfeit_ejected() {
                return;
            }

            self.record.transition(MatchState::ResolvingRound);
            let outcome = self.ctx.game.resolve(move_a.value, move_b.value);
            let result = RoundResult {
                round_index: round,
                move_a: move_a.value,
                move_b: move_b.value,
                outcome,
                latency_a_ms: move_a.latency_ms,
                latency_b_ms: move_b.latency_ms,
                substituted_a: move_a.substituted,
                substituted_b: move_b.substituted,
            };
            self.responded[0] |= move_a.responded;
            self.responded[1] |= move_b.responded;
            debug!(round, ?outcome, move_a = result.move_a, move_b = result.move_b, "round resolved");
            self.ctx.events.round_completed(&self.record.match_id, &result);
            self.record.push_round(result);

            if self.forfeit_ejected() {
                return;
            }
            let last = round == total;
            let majority_reached = self.record.scores.iter().any(|s| *s >= majority);
            if last || majority_reached {
                let reason = if last {
                    TerminationReason::AllRoundsPlayed
                } else {
                    TerminationReason::MajorityReached
                };
                self.conclude(reason);
                return;
            }
        }
    }

    /// Forfeit in favour of the other side if a player has been ejected.
    fn forfeit_ejected(&mut self) -> bool {
        let winner = match (self.is_ejected(Side::A), self.is_ejected(Side::B)) {
            (false, false) => return false,
            (true, false) => Some(Side::B),
            (false, true) => Some(Side::A),
            (true, true) => None,
        };
        info!(winner = ?winner, "player ejected, forfeiting match");
        self.record
            .seal(MatchState::Forfeited, winner, TerminationReason::PeerEjected);
        true
    }

    /// Close a match that was played out. A player that never answered a single move
    /// request forfeits.
    fn conclude(&mut self, reason: TerminationReason) {
        match self.responded {
            [true, true] => {
                let winner = self.record.leader();
                self.record.seal(MatchState::Completed, winner, reason);
            }
            [a, b] => {
                let winner = match (a, b) {
                    (true, false) => Some(Side::A),
                    (false, true) => Some(Side::B),
                    _ => None,
                };
                self.record
                    .seal(MatchState::Forfeited, winner, TerminationReason::Unresponsive);
            }
        }
    }

    async fn invite(&self, side: Side) -> Invitation {
        let peer = self.peer(side);
        let params = InviteMatchParams {
            match_id: self.record.match_id.clone(),
            game_id: self.ctx.game.game_id().to_string(),
            side,
            opponent_id: self.peer(side.other()).id.clone(),
            total_rounds: self.record.total_rounds,
            auth_token: peer.auth_token.clone(),
        };
        let Ok(params) = encode(&params) else {
            return Invitation::NoResponse;
        };
        let outcome = self
            .ctx
            .transport
            .call(
                &peer.id,
                &peer.endpoint,
                Method::InviteMatch,
                params,
                self.ctx.constraints.invitation_timeout(),
            )
            .await;
        let latency_ms = outcome.latency_ms();
        match outcome.reply {
            Reply::Valid(value) => match decode_params::<InviteMatchResult>(value) {
                Ok(InviteMatchResult { accepted: true }) => Invitation::Accepted,
                Ok(_) => {
                    debug!(peer = %peer.id, "invitation declined");
                    self.ctx
                        .detector
                        .observe(&peer.id, OutcomeKind::Timeout, latency_ms);
                    Invitation::Declined
                }
                Err(e) => {
                    debug!(peer = %peer.id, error = %e, "bad invitation answer");
                    self.ctx
                        .detector
                        .observe(&peer.id, OutcomeKind::Invalid, latency_ms);
                    Invitation::Declined
                }
            },
            reply => {
                debug!(peer = %peer.id, ?reply, "no answer to invitation");
                Invitation::NoResponse
            }
        }
    }

    async fn collect_move(&self, side: Side, round: u32) -> CollectedMove {
        let peer = self.peer(side);
        let move_timeout = self.ctx.constraints.move_timeout();
        let fallback = self.ctx.game.fallback_move();
        let params = RequestMoveParams {
            match_id: self.record.match_id.clone(),
            game_id: self.ctx.game.game_id().to_string(),
            round,
            side,
            opponent_history: self.record.opponent_history(side),
            timeout_ms: move_timeout.as_millis() as u64,
            auth_token: peer.auth_token.clone(),
        };
        let Ok(params) = encode(&params) else {
            return CollectedMove {
                value: fallback,
                latency_ms: 0,
                substituted: true,
                responded: false,
            };
        };
        let outcome = self
            .ctx
            .transport
            .call(&peer.id, &peer.endpoint, Method::RequestMove, params, move_timeout)
            .await;
        let latency_ms = outcome.latency_ms();
        let substitute = |responded| CollectedMove {
            value: fallback,
            latency_ms,
            substituted: true,
            responded,
        };

        match outcome.reply {
            Reply::Valid(value) => {
                let checked = decode_params::<RequestMoveResult>(value)
                    .map_err(|e| ValidationError::Malformed(e.to_string()))
                    .and_then(|r| self.ctx.game.validate(r.value));
                match checked {
                    Ok(value) => CollectedMove {
                        value,
                        latency_ms,
                        substituted: false,
                        responded: true,
                    },
                    Err(e) => {
                        debug!(peer = %peer.id, round, error = %e, "invalid move, substituting");
                        self.ctx
                            .detector
                            .observe(&peer.id, OutcomeKind::Invalid, latency_ms);
                        substitute(true)
                    }
                }
            }
            Reply::Invalid(reason) => {
                debug!(peer = %peer.id, round, %reason, "invalid answer, substituting");
                substitute(true)
            }
            Reply::TimedOut | Reply::Unreachable => {
                debug!(peer = %peer.id, round, "no move, substituting");
                substitute(false)
            }
        }
    }

    fn release(&self) {
        for peer in &self.players {
            self.ctx.registry.set_status(&peer.id, PeerStatus::Available);
        }
    }

    /// Tell both players how the match ended. Not observed by the detector.
    async fn report(&self) {
        let timeout = self.ctx.constraints.rpc_timeout();
        let sends = self
            .players
            .iter()
            .filter(|p| !self.ctx.detector.is_ejected(&p.id))
            .filter_map(|peer| {
                let params = encode(&ReportResultParams {
                    match_id: self.record.match_id.clone(),
                    state: self.record.state,
                    winner: self.record.winner.clone(),
                    scores: self.record.scores,
                    rounds_played: self.record.rounds_played,
                    auth_token: peer.auth_token.clone(),
                })
                .ok()?;
                Some(async move {
                    let outcome = self
                        .ctx
                        .transport
                        .notify(&peer.endpoint, Method::ReportResult, params, timeout)
                        .await;
                    if !matches!(outcome.reply, Reply::Valid(_)) {
                        debug!(peer = %peer.id, reply = ?outcome.reply, "result not acknowledged");
                    }
                })
            });
        futures::future::join_all(sends).await;
    }
}

/// Resolves once `cancel` holds true. Never resolves without a receiver or once the sender
/// is gone.
async fn cancelled(cancel: Option<watch::Receiver<bool>>) {
    if let Some(mut rx) = cancel {
        let fired = rx.wait_for(|c| *c).await.is_ok();
        if fired {
            return;
        }
    }
    std::future::pending::<()>().await
}
