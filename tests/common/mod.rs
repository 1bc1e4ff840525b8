#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use agent_league::agent::{Credentials, PlayerAgent};
use agent_league::constraints::{Constraints, ConstraintsBuilder};
use agent_league::error::ProtocolError;
use agent_league::events::{ChannelSink, Event};
use agent_league::prelude::*;
use agent_league::protocol::Method;
use agent_league::registry::PeerRecord;
use agent_league::rpc_server::RpcHandler;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;

/// Accepts every invitation, then never answers.
pub struct Mute;

impl RpcHandler for Mute {
    fn handle(&self, method: Method, _params: Value) -> BoxFuture<'_, Result<Value, ProtocolError>> {
        Box::pin(async move {
            match method {
                Method::InviteMatch => Ok(json!({ "accepted": true })),
                _ => std::future::pending().await,
            }
        })
    }
}

/// Never answers anything.
pub struct BlackHole;

impl RpcHandler for BlackHole {
    fn handle(&self, _method: Method, _params: Value) -> BoxFuture<'_, Result<Value, ProtocolError>> {
        Box::pin(std::future::pending())
    }
}

/// No printing, no retries.
pub fn quiet() -> Configuration {
    Configuration::new()
        .with_verbose(false)
        .with_retries(0, Duration::from_millis(10), Duration::from_millis(10))
}

/// Generous timeouts, for leagues where everybody behaves.
pub fn relaxed_constraints() -> Constraints {
    ConstraintsBuilder::new()
        .with_registration_timeout(Duration::from_millis(200))
        .with_invitation_timeout(Duration::from_secs(1))
        .with_move_timeout(Duration::from_secs(1))
        .with_rpc_timeout(Duration::from_secs(1))
        .with_round_deadline(Duration::from_secs(30))
        .build()
        .unwrap()
}

/// Short timeouts, for leagues with silent players.
pub fn fast_constraints() -> Constraints {
    ConstraintsBuilder::new()
        .with_registration_timeout(Duration::from_millis(200))
        .with_invitation_timeout(Duration::from_millis(200))
        .with_move_timeout(Duration::from_millis(100))
        .with_rpc_timeout(Duration::from_millis(200))
        .with_round_deadline(Duration::from_secs(5))
        .build()
        .unwrap()
}

pub struct TestLeague {
    pub league: Arc<LeagueManager>,
    pub wire: Arc<LoopbackWire>,
    events: UnboundedReceiver<Event>,
}

/// Route league logs to the test output. Only the first call installs the subscriber.
pub fn trace() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

impl TestLeague {
    pub fn new(config: Configuration, constraints: Constraints) -> Self {
        trace();
        let wire = Arc::new(LoopbackWire::new());
        let (sink, events) = ChannelSink::new();
        let league = LeagueManager::builder()
            .with_configuration(config)
            .with_constraints(constraints)
            .with_wire(wire.clone())
            .with_event_sink(Arc::new(sink))
            .build()
            .unwrap();
        Self {
            league: Arc::new(league),
            wire,
            events,
        }
    }

    /// Register a peer served by `handler` at `endpoint`.
    pub fn handler(&self, endpoint: &str, handler: Arc<dyn RpcHandler>) -> PeerRecord {
        let peer = self
            .league
            .register(Role::Player, endpoint, Some(endpoint.to_string()))
            .unwrap();
        self.wire.bind(endpoint, handler);
        peer
    }

    /// Register a well-behaved player.
    pub fn agent(&self, endpoint: &str, strategy: Arc<dyn MoveStrategy>) -> (PeerRecord, Arc<PlayerAgent>) {
        let agent = Arc::new(PlayerAgent::new(endpoint, strategy));
        let peer = self.handler(endpoint, agent.clone());
        agent.set_credentials(Credentials {
            peer_id: peer.id.clone(),
            auth_token: peer.auth_token.clone(),
        });
        (peer, agent)
    }

    pub fn random_agents(&self, n: usize) -> Vec<(PeerRecord, Arc<PlayerAgent>)> {
        let strategies = StrategyRegistry::with_builtins();
        (0..n)
            .map(|i| {
                let strategy = strategies.create("random", "1..=5").unwrap();
                self.agent(&format!("player{i}:9000"), strategy)
            })
            .collect()
    }

    /// Every event emitted so far.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut events = vec![];
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
