//! # Agent League
//!
//! A league manager for autonomous agents that play a two-player game against each other over
//! JSON-RPC, round robin, with referees, standings and misbehaviour detection.
//!
//! It provides:
//! - A resilient JSON-RPC [`transport`] (timeouts, retries with jitter, per-endpoint circuit
//!   breakers, pooled HTTP connections) and an axum server for the serving side ([`rpc_server`])
//! - A peer [`registry`] with authenticated heartbeats
//! - A [`ByzantineDetector`](crate::detector::ByzantineDetector) scoring timeouts, invalid
//!   moves and latency anomalies, and ejecting peers at a threshold
//! - A referee match state machine ([`referee`]) with fallback moves, majority shortcut and
//!   deadlines
//! - A round-robin [`LeagueScheduler`](crate::tournament_scheduler::LeagueScheduler) running
//!   matches concurrently under a hard round deadline
//! - [`events`] for observers and JSON snapshots ([`store`]) to resume a league
//!
//! Every match is a sequence of rounds; in each round both players are asked for a move
//! concurrently and the round is resolved by a [`GameRule`](crate::game_interface::GameRule).
//! A player that does not answer, answers too late or answers nonsense gets a fallback move and
//! a mark on its behaviour score; enough marks and it is out of the league.
//!
//! # Documentation Overview
//!
//! - For running a league, see the [`league`] module.
//! - For configuring behaviour and timeouts, see
//!   [`Configuration`](crate::configuration::Configuration) and [`constraints`].
//! - For writing a player, implement [`MoveStrategy`](crate::game_interface::MoveStrategy) and
//!   serve it with a [`PlayerAgent`](crate::agent::PlayerAgent).
//! - For another game, implement [`GameRule`](crate::game_interface::GameRule).
//!
//! # Usage Example
//!
//! A manager and two players on localhost:
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//! use agent_league::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let constraints = ConstraintsBuilder::new()
//!         .with_move_timeout(Duration::from_secs(1))
//!         .build()?;
//!     let config = Configuration::new().with_total_rounds(5);
//!
//!     let league = Arc::new(
//!         LeagueManager::builder()
//!             .with_configuration(config)
//!             .with_constraints(constraints)
//!             .with_snapshot("league.json")
//!             .build()?,
//!     );
//!     let manager = RpcServer::bind("127.0.0.1:0", league.clone()).await?;
//!
//!     let strategies = StrategyRegistry::with_builtins();
//!     let transport = Transport::new(Arc::new(HttpWire::new()?));
//!     let mut servers = vec![];
//!     for (name, strategy, arg) in [("alice", "fixed", "2"), ("bob", "random", "1..=5")] {
//!         let agent = Arc::new(PlayerAgent::new(name, strategies.create(strategy, arg)?));
//!         let server = RpcServer::bind("127.0.0.1:0", agent.clone()).await?;
//!         agent
//!             .register_with(&transport, &manager.endpoint(), &server.endpoint(), Duration::from_secs(1))
//!             .await?;
//!         servers.push(server);
//!     }
//!
//!     league.await_players(2).await;
//!     for entry in league.run().await? {
//!         println!("{entry}");
//!     }
//!     Ok(())
//! }
//! ```
#![warn(missing_docs)]

pub use anyhow;

pub mod agent;
pub mod configuration;
pub mod constraints;
pub mod detector;
pub mod error;
pub mod events;
pub mod game_interface;
pub mod league;
mod logger;
pub mod match_record;
pub mod protocol;
pub mod referee;
pub mod registry;
pub mod rpc_server;
pub mod standings;
pub mod store;
pub mod strategy;
mod striped;
pub mod tournament_scheduler;
pub mod tournament_strategy;
pub mod transport;

/// Commonly used types and traits for quick access.
///
/// Import this prelude to get started easily:
/// ```rust
/// use agent_league::prelude::*;
/// ```
///
/// Includes:
/// - [`Configuration`](crate::configuration::Configuration)
/// - [`ConstraintsBuilder`](crate::constraints::ConstraintsBuilder)
/// - [`LeagueManager`](crate::league::LeagueManager)
/// - the player side: [`PlayerAgent`](crate::agent::PlayerAgent), strategies and games
/// - the transport and the RPC server
pub mod prelude {
    pub use crate::agent::PlayerAgent;
    pub use crate::configuration::Configuration;
    pub use crate::constraints::ConstraintsBuilder;
    pub use crate::events::{ChannelSink, EventSink};
    pub use crate::game_interface::{GameRule, Move, MoveStrategy, ParityGame, Side};
    pub use crate::league::LeagueManager;
    pub use crate::referee::EjectionPolicy;
    pub use crate::registry::Role;
    pub use crate::rpc_server::RpcServer;
    pub use crate::standings::StandingsEntry;
    pub use crate::strategy::StrategyRegistry;
    pub use crate::transport::{HttpWire, LoopbackWire, Transport};
}
