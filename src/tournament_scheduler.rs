//! Runs the league round by round.
//!
//! [`LeagueScheduler`] owns the schedule and the standings table and is their only writer.
//! Each round dispatches one task per match on a [`JoinSet`], bounded by a semaphore of
//! referee slots, and waits for all of them or for the hard round deadline. At the deadline
//! running matches are asked to stop; the ones that do not stop within a grace period are
//! aborted and recorded as forfeits.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::configuration::Configuration;
use crate::error::{AssignmentError, SchedulerError};
use crate::game_interface::Side;
use crate::match_record::{MatchRecord, MatchState, TerminationReason};
use crate::referee::{MatchMachine, RefereeContext};
use crate::registry::{PeerId, PeerStatus, Role};
use crate::standings::{OutcomeTally, Standings, StandingsEntry};
use crate::tournament_strategy::{Pairing, RoundRobinTournament, ScheduledRound, TournamentStrategy};

/// Referee id used when no referee peer is registered.
pub const LOCAL_REFEREE: &str = "local";

/// Extra time given to cancelled matches, on top of the RPC timeout they need to report.
pub const CANCEL_GRACE: Duration = Duration::from_millis(500);

/// What happened in one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundReport {
    /// Round run.
    pub round_number: u32,
    /// Every match of the round, walkovers included, in completion order.
    pub matches: Vec<MatchRecord>,
    /// Player sitting out.
    pub bye: Option<PeerId>,
    /// Pairings not started because a player was ejected or could not be assigned.
    pub walkovers: u32,
    /// Matches that had to be aborted at the round deadline.
    pub abandoned: u32,
    /// Table after the round.
    pub standings: Vec<StandingsEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Cancelling,
    Aborted,
}

/// Runs the rounds of a league schedule and keeps the standings.
///
/// Matches of a round run concurrently, at most `referee_slots` at a time, and the round is
/// bounded by the round deadline.
pub struct LeagueScheduler {
    ctx: Arc<RefereeContext>,
    strategy: Box<dyn TournamentStrategy>,
    total_rounds: u32,
    slots: Arc<Semaphore>,
    schedule: Vec<ScheduledRound>,
    completed: BTreeSet<u32>,
    standings: Standings,
    matches: Vec<MatchRecord>,
    next_referee: usize,
    published: watch::Sender<Vec<StandingsEntry>>,
}

impl LeagueScheduler {
    /// Empty scheduler with the round-robin strategy.
    pub fn new(ctx: Arc<RefereeContext>, config: &Configuration) -> Self {
        let slots = Arc::new(Semaphore::new(ctx.constraints.referee_slots()));
        let (published, _) = watch::channel(vec![]);
        Self {
            ctx,
            strategy: Box::new(RoundRobinTournament::default()),
            total_rounds: config.total_rounds(),
            slots,
            schedule: vec![],
            completed: BTreeSet::new(),
            standings: Standings::new(config.points),
            matches: vec![],
            next_referee: 0,
            published,
        }
    }

    /// Use another pairing strategy for the next [`LeagueScheduler::generate_schedule`].
    pub fn with_strategy(mut self, strategy: Box<dyn TournamentStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Pair `players` for the whole league. Replaces any previous schedule.
    pub fn generate_schedule(&mut self, players: &[PeerId]) -> &[ScheduledRound] {
        for player in players {
            self.standings.add_player(player);
        }
        self.schedule = self.strategy.schedule(players);
        self.completed.clear();
        self.publish();
        &self.schedule
    }

    /// Current schedule, empty before generation.
    pub fn schedule(&self) -> &[ScheduledRound] {
        &self.schedule
    }

    /// Round numbers already run, ascending.
    pub fn completed_rounds(&self) -> Vec<u32> {
        self.completed.iter().copied().collect()
    }

    /// Scheduled rounds not run yet, ascending.
    pub fn pending_rounds(&self) -> Vec<u32> {
        self.schedule
            .iter()
            .map(|r| r.round_number)
            .filter(|n| !self.completed.contains(n))
            .collect()
    }

    /// Table sorted by points, then peer id.
    pub fn standings(&self) -> Vec<StandingsEntry> {
        self.standings.sorted()
    }

    /// Outcome counts.
    pub fn tally(&self) -> OutcomeTally {
        self.standings.tally()
    }

    /// Underlying table.
    pub fn standings_table(&self) -> &Standings {
        &self.standings
    }

    /// Every sealed match so far.
    pub fn matches(&self) -> &[MatchRecord] {
        &self.matches
    }

    /// Standings published after each finished match.
    pub fn subscribe(&self) -> watch::Receiver<Vec<StandingsEntry>> {
        self.published.subscribe()
    }

    /// Resume from persisted state.
    pub fn restore(
        &mut self,
        schedule: Vec<ScheduledRound>,
        completed: impl IntoIterator<Item = u32>,
        standings: Standings,
        matches: Vec<MatchRecord>,
    ) {
        self.schedule = schedule;
        self.completed = completed.into_iter().collect();
        self.standings = standings;
        self.matches = matches;
        self.publish();
        info!(
            rounds = self.schedule.len(),
            completed = self.completed.len(),
            matches = self.matches.len(),
            "scheduler restored"
        );
    }

    /// Run every match of `round_number` and fold the results into the standings.
    #[instrument(skip(self))]
    pub async fn run_round(&mut self, round_number: u32) -> Result<RoundReport, SchedulerError> {
        if self.schedule.is_empty() {
            return Err(SchedulerError::NoSchedule);
        }
        let round = self
            .schedule
            .iter()
            .find(|r| r.round_number == round_number)
            .cloned()
            .ok_or(SchedulerError::UnknownRound(round_number))?;
        if !self.completed.insert(round_number) {
            return Err(SchedulerError::DuplicateRound(round_number));
        }
        info!(matches = round.pairings.len(), bye = ?round.bye, "round started");

        let mut report = RoundReport {
            round_number,
            matches: vec![],
            bye: round.bye.clone(),
            walkovers: 0,
            abandoned: 0,
            standings: vec![],
        };
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut running = JoinSet::new();
        let mut pending: Vec<MatchRecord> = vec![];

        for pairing in &round.pairings {
            let referee = self.next_referee();
            if let Some(winner) = self.walkover_winner(pairing) {
                self.walkover(round_number, pairing, referee, winner, &mut report);
                continue;
            }
            let machine = match MatchMachine::assign(
                self.ctx.clone(),
                round_number,
                &pairing.player_a,
                &pairing.player_b,
                &referee,
                self.total_rounds,
            ) {
                Ok(machine) => machine,
                Err(AssignmentError::PeerEjected(_)) => {
                    let winner = self.walkover_winner(pairing).unwrap_or(None);
                    self.walkover(round_number, pairing, referee, winner, &mut report);
                    continue;
                }
                Err(e) => {
                    error!(%pairing, error = %e, "match not assigned, recording a no contest");
                    self.walkover(round_number, pairing, referee, None, &mut report);
                    continue;
                }
            };
            pending.push(machine.record().clone());
            let slots = self.slots.clone();
            let mut cancel = cancel_rx.clone();
            running.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    true = async { cancel.wait_for(|c| *c).await.is_ok() } => {
                        return machine.abandon();
                    }
                    permit = slots.acquire_owned() => permit,
                };
                machine.with_cancel(cancel).run().await
            });
        }

        let grace = self.ctx.constraints.rpc_timeout() + CANCEL_GRACE;
        let mut wake = Instant::now() + self.ctx.constraints.round_deadline();
        let mut phase = Phase::Running;
        loop {
            tokio::select! {
                joined = running.join_next() => match joined {
                    None => break,
                    Some(Ok(record)) => {
                        pending.retain(|p| p.match_id != record.match_id);
                        self.complete(record, &mut report);
                    }
                    Some(Err(e)) if e.is_cancelled() => {}
                    Some(Err(e)) => error!(error = %e, "match task failed"),
                },
                _ = tokio::time::sleep_until(wake), if phase != Phase::Aborted => match phase {
                    Phase::Running => {
                        warn!(running = running.len(), "round deadline reached, cancelling matches");
                        let _ = cancel_tx.send(true);
                        phase = Phase::Cancelling;
                        wake = Instant::now() + grace;
                    }
                    _ => {
                        warn!(running = running.len(), "aborting matches that ignored cancellation");
                        running.abort_all();
                        phase = Phase::Aborted;
                    }
                },
            }
        }

        for mut record in pending {
            warn!(match_id = %record.match_id, pairing = %record, "match abandoned");
            for peer in [&record.player_a_id, &record.player_b_id] {
                self.ctx.registry.set_status(peer, PeerStatus::Available);
            }
            record.seal(MatchState::Forfeited, None, TerminationReason::RoundDeadline);
            report.abandoned += 1;
            self.complete(record, &mut report);
        }

        report.standings = self.standings.sorted();
        info!(
            matches = report.matches.len(),
            walkovers = report.walkovers,
            abandoned = report.abandoned,
            "round finished"
        );
        Ok(report)
    }

    /// Run every pending round in order.
    pub async fn run_all(&mut self) -> Result<Vec<RoundReport>, SchedulerError> {
        let mut reports = vec![];
        for round in self.pending_rounds() {
            reports.push(self.run_round(round).await?);
        }
        Ok(reports)
    }

    fn next_referee(&mut self) -> PeerId {
        let referees = self.ctx.registry.active(Role::Referee);
        if referees.is_empty() {
            return LOCAL_REFEREE.to_string();
        }
        let referee = referees[self.next_referee % referees.len()].id.clone();
        self.next_referee = self.next_referee.wrapping_add(1);
        referee
    }

    /// `Some(winner)` if the pairing cannot be played because of an ejection.
    fn walkover_winner(&self, pairing: &Pairing) -> Option<Option<Side>> {
        let a = self.ctx.detector.is_ejected(&pairing.player_a);
        let b = self.ctx.detector.is_ejected(&pairing.player_b);
        match (a, b) {
            (false, false) => None,
            (true, false) => Some(Some(Side::B)),
            (false, true) => Some(Some(Side::A)),
            (true, true) => Some(None),
        }
    }

    fn walkover(
        &mut self,
        round_number: u32,
        pairing: &Pairing,
        referee: PeerId,
        winner: Option<Side>,
        report: &mut RoundReport,
    ) {
        info!(%pairing, ?winner, "walkover");
        let record = MatchRecord::walkover(
            round_number,
            pairing.player_a.clone(),
            pairing.player_b.clone(),
            referee,
            self.total_rounds,
            winner,
        );
        report.walkovers += 1;
        self.complete(record, report);
    }

    fn complete(&mut self, record: MatchRecord, report: &mut RoundReport) {
        if !self.standings.record(&record) {
            debug!(match_id = %record.match_id, "match not counted");
        }
        let table = self.standings.sorted();
        self.ctx.events.match_completed(&record);
        self.ctx.events.standings_updated(&table);
        self.published.send_replace(table);
        self.matches.push(record.clone());
        report.matches.push(record);
    }

    fn publish(&self) {
        self.published.send_replace(self.standings.sorted());
    }
}

#[cfg(test)]
mod scheduler_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::BoxFuture;
    use serde_json::{json, Value};

    use super::*;
    use crate::agent::{Credentials, PlayerAgent};
    use crate::constraints::{Constraints, ConstraintsBuilder};
    use crate::detector::{ByzantineDetector, DetectorSettings};
    use crate::error::ProtocolError;
    use crate::events::NullSink;
    use crate::game_interface::ParityGame;
    use crate::protocol::Method;
    use crate::referee::EjectionPolicy;
    use crate::registry::Registry;
    use crate::rpc_server::RpcHandler;
    use crate::strategy::RandomStrategy;
    use crate::transport::{LoopbackWire, RetryPolicy, Transport};

    /// Never answers anything.
    struct BlackHole;

    impl RpcHandler for BlackHole {
        fn handle(&self, _method: Method, _params: Value) -> BoxFuture<'_, Result<Value, ProtocolError>> {
            Box::pin(std::future::pending())
        }
    }

    fn constraints(move_timeout: Duration, invitation: Duration, round_deadline: Duration) -> Constraints {
        ConstraintsBuilder::new()
            .with_move_timeout(move_timeout)
            .with_invitation_timeout(invitation)
            .with_rpc_timeout(Duration::from_millis(100))
            .with_round_deadline(round_deadline)
            .with_match_deadline(Duration::from_secs(30))
            .build()
            .unwrap()
    }

    fn setup(move_timeout: Duration, round_deadline: Duration) -> (Arc<RefereeContext>, Arc<LoopbackWire>) {
        setup_with(constraints(move_timeout, Duration::from_millis(200), round_deadline))
    }

    fn setup_with(constraints: Constraints) -> (Arc<RefereeContext>, Arc<LoopbackWire>) {
        let move_timeout = constraints.move_timeout();
        let registry = Arc::new(Registry::new());
        let settings = DetectorSettings {
            move_timeout,
            ..DetectorSettings::default()
        };
        let detector = Arc::new(ByzantineDetector::new(settings, registry.clone(), Arc::new(NullSink)));
        let wire = Arc::new(LoopbackWire::new());
        let transport = Transport::new(wire.clone())
            .with_retry(RetryPolicy::none())
            .with_observer(detector.clone());
        let ctx = Arc::new(RefereeContext {
            transport: Arc::new(transport),
            registry,
            detector,
            events: Arc::new(NullSink),
            game: Arc::new(ParityGame),
            constraints,
            ejection_policy: EjectionPolicy::RoundBoundary,
        });
        (ctx, wire)
    }

    fn add_player(ctx: &RefereeContext, wire: &LoopbackWire, endpoint: &str) -> PeerId {
        let peer = ctx.registry.register(Role::Player, endpoint, None).unwrap();
        let agent = Arc::new(PlayerAgent::new(endpoint, Arc::new(RandomStrategy::new(1, 5).unwrap())));
        agent.set_credentials(Credentials {
            peer_id: peer.id.clone(),
            auth_token: peer.auth_token.clone(),
        });
        wire.bind(endpoint, agent);
        peer.id
    }

    #[tokio::test]
    async fn full_league_keeps_standings_consistent() {
        let (ctx, wire) = setup(Duration::from_secs(1), Duration::from_secs(10));
        let players: Vec<_> = (0..5)
            .map(|i| add_player(&ctx, &wire, &format!("p{i}:1")))
            .collect();
        let mut scheduler = LeagueScheduler::new(ctx, &Configuration::new());
        assert_eq!(scheduler.generate_schedule(&players).len(), 5);

        let reports = scheduler.run_all().await.unwrap();
        assert_eq!(reports.len(), 5);
        assert!(reports.iter().all(|r| r.bye.is_some() && r.matches.len() == 2));
        assert_eq!(scheduler.matches().len(), 10);
        assert_eq!(scheduler.tally().total(), 10);
        assert!(scheduler.standings_table().is_consistent());
        assert!(scheduler.standings().iter().all(|e| e.matches_played == 4));
        assert!(scheduler.pending_rounds().is_empty());
    }

    #[tokio::test]
    async fn rounds_cannot_be_run_twice() {
        let (ctx, wire) = setup(Duration::from_secs(1), Duration::from_secs(10));
        let players = vec![add_player(&ctx, &wire, "a:1"), add_player(&ctx, &wire, "b:1")];
        let mut scheduler = LeagueScheduler::new(ctx, &Configuration::new());

        assert_eq!(scheduler.run_round(1).await.unwrap_err(), SchedulerError::NoSchedule);
        scheduler.generate_schedule(&players);
        assert_eq!(scheduler.run_round(7).await.unwrap_err(), SchedulerError::UnknownRound(7));
        scheduler.run_round(1).await.unwrap();
        assert_eq!(scheduler.run_round(1).await.unwrap_err(), SchedulerError::DuplicateRound(1));
        assert_eq!(scheduler.matches().len(), 1);
    }

    #[tokio::test]
    async fn ejected_players_get_walkovers() {
        let (ctx, wire) = setup(Duration::from_secs(1), Duration::from_secs(10));
        let a = add_player(&ctx, &wire, "a:1");
        let b = add_player(&ctx, &wire, "b:1");
        ctx.registry.mark_ejected(&b);
        let mut scheduler = LeagueScheduler::new(ctx, &Configuration::new());
        scheduler.generate_schedule(&[a.clone(), b.clone()]);

        let report = scheduler.run_round(1).await.unwrap();
        assert_eq!(report.walkovers, 1);
        let record = &report.matches[0];
        assert_eq!(record.termination, Some(TerminationReason::Walkover));
        assert_eq!(record.winner.as_deref(), Some(a.as_str()));
        assert_eq!(scheduler.standings_table().get(&a).unwrap().points, 3);
    }

    #[tokio::test]
    async fn unassignable_pairing_is_a_no_contest() {
        let (ctx, wire) = setup(Duration::from_secs(1), Duration::from_secs(10));
        let a = add_player(&ctx, &wire, "a:1");
        let mut scheduler = LeagueScheduler::new(ctx, &Configuration::new());
        scheduler.generate_schedule(&[a.clone(), "P0099".to_string()]);

        let report = scheduler.run_round(1).await.unwrap();
        assert_eq!(report.matches.len(), 1);
        let record = &report.matches[0];
        assert_eq!(record.state, MatchState::Forfeited);
        assert_eq!(record.winner, None);
        assert_eq!(scheduler.tally().no_contest, 1);
        assert_eq!(scheduler.standings_table().get(&a).unwrap().losses, 1);
        assert!(scheduler.standings_table().is_consistent());
    }

    #[tokio::test]
    async fn round_deadline_forfeits_stuck_matches() {
        // invitations outlive the round
        let (ctx, wire) = setup_with(constraints(
            Duration::from_millis(100),
            Duration::from_secs(5),
            Duration::from_millis(300),
        ));
        let a = ctx.registry.register(Role::Player, "a:1", None).unwrap().id;
        let b = ctx.registry.register(Role::Player, "b:1", None).unwrap().id;
        wire.bind("a:1", Arc::new(BlackHole));
        wire.bind("b:1", Arc::new(BlackHole));
        let mut scheduler = LeagueScheduler::new(ctx.clone(), &Configuration::new());
        scheduler.generate_schedule(&[a.clone(), b]);

        let started = std::time::Instant::now();
        let report = scheduler.run_round(1).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(report.matches.len(), 1);
        let record = &report.matches[0];
        assert_eq!(record.state, MatchState::Forfeited);
        assert_eq!(record.termination, Some(TerminationReason::RoundDeadline));
        assert_eq!(record.winner, None);
        assert_eq!(scheduler.tally().no_contest, 1);
        assert!(scheduler.standings_table().is_consistent());
        assert_eq!(ctx.registry.get(&a).unwrap().status, PeerStatus::Available);
    }

    /// Accepts invitations, never plays, counts result reports.
    struct Stall(Arc<AtomicUsize>);

    impl RpcHandler for Stall {
        fn handle(&self, method: Method, _params: Value) -> BoxFuture<'_, Result<Value, ProtocolError>> {
            Box::pin(async move {
                match method {
                    Method::InviteMatch => Ok(json!({ "accepted": true })),
                    Method::ReportResult => {
                        self.0.fetch_add(1, Ordering::SeqCst);
                        Ok(json!({ "ok": true }))
                    }
                    Method::RequestMove => std::future::pending().await,
                    _ => Ok(json!({})),
                }
            })
        }
    }

    #[tokio::test]
    async fn queued_matches_are_dropped_silently_at_the_deadline() {
        let constraints = ConstraintsBuilder::new()
            .with_move_timeout(Duration::from_millis(250))
            .with_invitation_timeout(Duration::from_millis(200))
            .with_rpc_timeout(Duration::from_millis(100))
            .with_round_deadline(Duration::from_millis(300))
            .with_match_deadline(Duration::from_secs(30))
            .with_referee_slots(1)
            .build()
            .unwrap();
        let (ctx, wire) = setup_with(constraints);
        let reports = Arc::new(AtomicUsize::new(0));
        let players: Vec<_> = (0..4)
            .map(|i| {
                let endpoint = format!("p{i}:1");
                let id = ctx.registry.register(Role::Player, &endpoint, None).unwrap().id;
                wire.bind(endpoint, Arc::new(Stall(reports.clone())));
                id
            })
            .collect();
        let mut scheduler = LeagueScheduler::new(ctx, &Configuration::new());
        scheduler.generate_schedule(&players);

        let report = scheduler.run_round(1).await.unwrap();
        assert_eq!(report.matches.len(), 2);
        assert!(report
            .matches
            .iter()
            .all(|m| m.termination == Some(TerminationReason::RoundDeadline)));
        let never_started = report.matches.iter().filter(|m| m.history.is_empty()).count();
        assert!(never_started >= 1);
        // only the match that held the slot told its players
        assert_eq!(reports.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn referees_are_assigned_in_turn() {
        let (ctx, wire) = setup(Duration::from_secs(1), Duration::from_secs(10));
        let players: Vec<_> = (0..4)
            .map(|i| add_player(&ctx, &wire, &format!("p{i}:1")))
            .collect();
        let r1 = ctx.registry.register(Role::Referee, "r1:1", None).unwrap().id;
        let r2 = ctx.registry.register(Role::Referee, "r2:1", None).unwrap().id;
        let mut scheduler = LeagueScheduler::new(ctx, &Configuration::new());
        scheduler.generate_schedule(&players);

        let report = scheduler.run_round(1).await.unwrap();
        let mut referees: Vec<_> = report.matches.iter().map(|m| m.referee_id.clone()).collect();
        referees.sort();
        assert_eq!(referees, vec![r1, r2]);
    }
}
