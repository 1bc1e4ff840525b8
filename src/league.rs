//! The league manager: registration desk, scheduler driver and persistence.
//!
//! [`LeagueManager`] wires the components together (registry, detector, transport, referee
//! context and scheduler) and serves the manager's side of the protocol: `register_peer`,
//! `heartbeat` and `health_check`. A league goes through three steps:
//!
//! 1. players register, over RPC or with [`LeagueManager::register`];
//! 2. [`LeagueManager::await_players`] waits for enough of them, up to the registration timeout;
//! 3. [`LeagueManager::run`] closes registration, generates the round-robin schedule and plays
//!    every round, saving a snapshot after each one when a store is configured.
//!
//! Behaviour is controlled by a [`Configuration`] and timeouts by [`Constraints`]. When
//! `config.log` is set a log file is created in the working directory, and when
//! `config.verbose` is set results are printed to stdout as they come.
//!
//! # Restarting
//!
//! With [`LeagueBuilder::with_snapshot`], a league built over an existing snapshot resumes
//! where it stopped: peers, schedule, standings and match history are restored, and rounds
//! already played are not played again.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use futures::future::{join_all, BoxFuture};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::configuration::Configuration;
use crate::constraints::Constraints;
use crate::detector::{BehaviorScore, ByzantineDetector, DetectorSettings};
use crate::error::{ProtocolError, RegistrationError, SchedulerError};
use crate::events::{ConsoleSink, EventSink, FanoutSink, LogSink};
use crate::game_interface::{GameRule, ParityGame};
use crate::logger::init_logger;
use crate::protocol::{
    decode_params, encode, HealthStatus, HeartbeatParams, HeartbeatResult, Method,
    RegisterPeerParams, RegisterPeerResult,
};
use crate::referee::RefereeContext;
use crate::registry::{PeerId, PeerRecord, PeerStatus, Registry, Role};
use crate::rpc_server::RpcHandler;
use crate::standings::{Standings, StandingsEntry};
use crate::store::{Snapshot, SnapshotStore, SNAPSHOT_VERSION};
use crate::tournament_scheduler::{LeagueScheduler, RoundReport};
use crate::tournament_strategy::{ScheduledRound, TournamentStrategy};
use crate::transport::{HttpWire, Transport, Wire};

/// Collects the pieces of a [`LeagueManager`].
pub struct LeagueBuilder {
    config: Configuration,
    constraints: Constraints,
    game: Arc<dyn GameRule>,
    wire: Option<Arc<dyn Wire>>,
    sinks: Vec<Arc<dyn EventSink>>,
    store: Option<SnapshotStore>,
    strategy: Option<Box<dyn TournamentStrategy>>,
}

impl LeagueBuilder {
    /// Defaults: [`ParityGame`], HTTP transport, no snapshot.
    pub fn new() -> Self {
        Self {
            config: Configuration::default(),
            constraints: Constraints::default(),
            game: Arc::new(ParityGame),
            wire: None,
            sinks: vec![],
            store: None,
            strategy: None,
        }
    }

    /// League behaviour, see [`Configuration`].
    pub fn with_configuration(mut self, config: Configuration) -> Self {
        self.config = config;
        self
    }

    /// Timeouts and referee slots.
    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Game played in every match.
    pub fn with_game(mut self, game: Arc<dyn GameRule>) -> Self {
        self.game = game;
        self
    }

    /// Talk to peers through `wire` instead of HTTP.
    pub fn with_wire(mut self, wire: Arc<dyn Wire>) -> Self {
        self.wire = Some(wire);
        self
    }

    /// Also deliver events to `sink`.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Persist the league to `path`, and resume from it if it exists.
    pub fn with_snapshot(mut self, path: impl Into<PathBuf>) -> Self {
        self.store = Some(SnapshotStore::new(path));
        self
    }

    /// Pairing strategy, round robin by default.
    pub fn with_strategy(mut self, strategy: Box<dyn TournamentStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Assemble the league, restoring the snapshot if there is one.
    #[instrument(skip_all)]
    pub fn build(self) -> anyhow::Result<LeagueManager> {
        let LeagueBuilder {
            config,
            constraints,
            game,
            wire,
            sinks,
            store,
            strategy,
        } = self;

        if config.log {
            let path = init_logger(".")?;
            info!(path = %path.display(), "logging to file");
        }
        trace!(?config, ?constraints);

        let mut fanout = FanoutSink::new().with(Arc::new(LogSink));
        if config.verbose {
            fanout = fanout.with(Arc::new(ConsoleSink));
        }
        for sink in sinks {
            fanout = fanout.with(sink);
        }
        let events: Arc<dyn EventSink> = Arc::new(fanout);

        let registry = Arc::new(Registry::new());
        let detector = Arc::new(ByzantineDetector::new(
            DetectorSettings::from_parts(&config, &constraints),
            registry.clone(),
            events.clone(),
        ));
        let wire: Arc<dyn Wire> = match wire {
            Some(wire) => wire,
            None => Arc::new(HttpWire::new()?),
        };
        let transport =
            Arc::new(Transport::from_config(wire, &config).with_observer(detector.clone()));
        let ctx = Arc::new(RefereeContext {
            transport: transport.clone(),
            registry: registry.clone(),
            detector: detector.clone(),
            events: events.clone(),
            game,
            constraints: constraints.clone(),
            ejection_policy: config.ejection_policy(),
        });

        let mut scheduler = LeagueScheduler::new(ctx, &config);
        if let Some(strategy) = strategy {
            scheduler = scheduler.with_strategy(strategy);
        }
        if let Some(store) = &store {
            if let Some(snapshot) = store.load()? {
                restore(&registry, &mut scheduler, snapshot);
            }
        }

        let standings = scheduler.subscribe();
        let (players_joined, _) = watch::channel(registry.active(Role::Player).len());
        Ok(LeagueManager {
            config,
            constraints,
            registry,
            detector,
            transport,
            events,
            scheduler: Mutex::new(scheduler),
            standings,
            store,
            registration_open: AtomicBool::new(true),
            players_joined,
        })
    }
}

impl Default for LeagueBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn restore(registry: &Registry, scheduler: &mut LeagueScheduler, snapshot: Snapshot) {
    for peer in snapshot.peers {
        registry.restore(peer);
    }
    let standings = Standings::restore(snapshot.points, snapshot.standings, snapshot.tally);
    scheduler.restore(
        snapshot.schedule,
        snapshot.completed_rounds,
        standings,
        snapshot.matches,
    );
}

/// Runs a league. Serve it with [`RpcServer`](crate::rpc_server::RpcServer) so players can
/// register.
pub struct LeagueManager {
    config: Configuration,
    constraints: Constraints,
    registry: Arc<Registry>,
    detector: Arc<ByzantineDetector>,
    transport: Arc<Transport>,
    events: Arc<dyn EventSink>,
    scheduler: Mutex<LeagueScheduler>,
    standings: watch::Receiver<Vec<StandingsEntry>>,
    store: Option<SnapshotStore>,
    registration_open: AtomicBool,
    players_joined: watch::Sender<usize>,
}

impl LeagueManager {
    /// Shortcut for [`LeagueBuilder::new`].
    pub fn builder() -> LeagueBuilder {
        LeagueBuilder::new()
    }

    /// Configuration in use.
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Constraints in use.
    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    /// Registered peers.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Behaviour scores.
    pub fn detector(&self) -> &Arc<ByzantineDetector> {
        &self.detector
    }

    /// Transport used to reach peers.
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Add a peer. Refused once the league started.
    pub fn register(
        &self,
        role: Role,
        endpoint: &str,
        display_name: Option<String>,
    ) -> Result<PeerRecord, RegistrationError> {
        if !self.registration_open.load(Ordering::Acquire) {
            debug!(endpoint, "registration after close");
            return Err(RegistrationError::Closed);
        }
        let peer = self.registry.register(role, endpoint, display_name)?;
        self.events.peer_registered(&peer);
        if role == Role::Player {
            self.players_joined
                .send_replace(self.registry.active(Role::Player).len());
        }
        Ok(peer)
    }

    /// Authenticated keep-alive.
    pub fn heartbeat(&self, peer_id: &str, auth_token: &str) -> Result<PeerStatus, ProtocolError> {
        self.registry.heartbeat(peer_id, auth_token)
    }

    /// Refuse new registrations. Called by [`LeagueManager::run`].
    pub fn close_registration(&self) {
        if self.registration_open.swap(false, Ordering::AcqRel) {
            info!(players = self.registry.active(Role::Player).len(), "registration closed");
        }
    }

    /// Wait until `min_players` players registered or the registration timeout elapsed.
    /// Returns the number of players.
    pub async fn await_players(&self, min_players: usize) -> usize {
        let mut joined = self.players_joined.subscribe();
        let waited = tokio::time::timeout(
            self.constraints.registration_timeout(),
            joined.wait_for(|n| *n >= min_players),
        )
        .await;
        if let Ok(Ok(n)) = waited {
            return *n;
        }
        let n = self.registry.active(Role::Player).len();
        warn!(players = n, expected = min_players, "registration timeout");
        n
    }

    /// Health-check every active player. Answering players are marked alive; the others are
    /// returned.
    pub async fn probe_peers(&self) -> Vec<PeerId> {
        let timeout = self.constraints.rpc_timeout();
        let players = self.registry.active(Role::Player);
        let checks = players.iter().map(|peer| async move {
            let alive = self.transport.health_check(&peer.endpoint, timeout).await;
            (peer, alive)
        });
        let mut unreachable = vec![];
        for (peer, alive) in join_all(checks).await {
            if alive {
                self.registry.touch(&peer.id);
            } else {
                warn!(%peer, "health check failed");
                unreachable.push(peer.id.clone());
            }
        }
        unreachable
    }

    /// Close registration and pair the registered players, unless a schedule already exists.
    /// Returns the schedule.
    ///
    /// # Errors
    /// Fails with fewer than two players, or if a snapshot cannot be written.
    pub async fn start(&self) -> anyhow::Result<Vec<ScheduledRound>> {
        self.close_registration();
        let mut scheduler = self.scheduler.lock().await;
        self.ensure_schedule(&mut scheduler)?;
        Ok(scheduler.schedule().to_vec())
    }

    fn ensure_schedule(&self, scheduler: &mut LeagueScheduler) -> anyhow::Result<()> {
        if !scheduler.schedule().is_empty() {
            return Ok(());
        }
        let players: Vec<PeerId> = self
            .registry
            .active(Role::Player)
            .into_iter()
            .map(|p| p.id)
            .collect();
        if players.len() < 2 {
            bail!("A league needs at least two players, got {}", players.len());
        }
        let rounds = scheduler.generate_schedule(&players).len();
        info!(players = players.len(), rounds, "league started");
        self.persist(scheduler)
    }

    /// Play every remaining round and return the final standings.
    ///
    /// # Errors
    /// Fails with fewer than two players, or if a snapshot cannot be written.
    #[instrument(skip_all)]
    pub async fn run(&self) -> anyhow::Result<Vec<StandingsEntry>> {
        self.close_registration();
        let mut scheduler = self.scheduler.lock().await;
        self.ensure_schedule(&mut scheduler)?;

        for round in scheduler.pending_rounds() {
            scheduler
                .run_round(round)
                .await
                .with_context(|| format!("round {round}"))?;
            self.persist(&scheduler)?;
        }

        if !scheduler.standings_table().is_consistent() {
            error!(tally = ?scheduler.tally(), "standings do not add up");
        }
        let standings = scheduler.standings();
        info!(?standings, "league finished");
        Ok(standings)
    }

    /// Run a single round. A snapshot write failure is logged, not returned.
    pub async fn run_round(&self, round_number: u32) -> Result<RoundReport, SchedulerError> {
        self.close_registration();
        let mut scheduler = self.scheduler.lock().await;
        let report = scheduler.run_round(round_number).await?;
        if let Err(e) = self.persist(&scheduler) {
            error!(error = %format!("{e:#}"), "could not save snapshot");
        }
        Ok(report)
    }

    /// Latest published standings. Does not wait for a running round.
    pub fn standings(&self) -> Vec<StandingsEntry> {
        self.standings.borrow().clone()
    }

    /// Non-zero behaviour scores.
    pub fn scores(&self) -> Vec<BehaviorScore> {
        self.detector.scores()
    }

    /// Current state, as it would be persisted.
    pub async fn snapshot(&self) -> Snapshot {
        let scheduler = self.scheduler.lock().await;
        self.snapshot_of(&scheduler)
    }

    fn snapshot_of(&self, scheduler: &LeagueScheduler) -> Snapshot {
        let table = scheduler.standings_table();
        Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: OffsetDateTime::now_utc(),
            peers: self.registry.peers(),
            schedule: scheduler.schedule().to_vec(),
            completed_rounds: scheduler.completed_rounds(),
            matches: scheduler.matches().to_vec(),
            points: table.points_table(),
            standings: table.sorted(),
            tally: table.tally(),
        }
    }

    fn persist(&self, scheduler: &LeagueScheduler) -> anyhow::Result<()> {
        match &self.store {
            Some(store) => store.save(&self.snapshot_of(scheduler)),
            None => Ok(()),
        }
    }
}

impl RpcHandler for LeagueManager {
    fn handle(&self, method: Method, params: Value) -> BoxFuture<'_, Result<Value, ProtocolError>> {
        Box::pin(async move {
            match method {
                Method::RegisterPeer => {
                    let params: RegisterPeerParams = decode_params(params)?;
                    let peer = self.register(params.role, &params.endpoint, params.display_name)?;
                    encode(&RegisterPeerResult {
                        peer_id: peer.id,
                        auth_token: peer.auth_token,
                    })
                }
                Method::Heartbeat => {
                    let params: HeartbeatParams = decode_params(params)?;
                    let status = self.heartbeat(&params.peer_id, &params.auth_token)?;
                    encode(&HeartbeatResult { status })
                }
                Method::HealthCheck => encode(&HealthStatus::ok()),
                Method::InviteMatch | Method::RequestMove | Method::ReportResult => {
                    Err(ProtocolError::Unsupported(method.to_string()))
                }
            }
        })
    }
}
