//! Fire-and-forget notifications for external consumers (dashboards, logs, tests).
//!
//! The league never waits on a sink: every [`EventSink`] method must return promptly and must
//! not fail. Nothing in the core depends on whether anyone listens.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::info;

use crate::detector::BehaviorScore;
use crate::match_record::{MatchRecord, RoundResult};
use crate::registry::PeerRecord;
use crate::standings::StandingsEntry;

/// `peer.registered`
pub const PEER_REGISTERED: &str = "peer.registered";
/// `match.started`
pub const MATCH_STARTED: &str = "match.started";
/// `round.completed`
pub const ROUND_COMPLETED: &str = "round.completed";
/// `match.completed`
pub const MATCH_COMPLETED: &str = "match.completed";
/// `peer.ejected`
pub const PEER_EJECTED: &str = "peer.ejected";
/// `standings.updated`
pub const STANDINGS_UPDATED: &str = "standings.updated";

/// One notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// One of the `*` constants of this module.
    pub event_type: String,
    /// Event-specific body.
    pub payload: Value,
    /// Emission time.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Event {
    /// New event stamped now.
    pub fn new(event_type: &str, payload: Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            payload,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

fn to_payload<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_default()
}

/// Typed notification interface invoked by the league, the referee and the detector.
///
/// Implementors only have to provide [`EventSink::emit`]; the typed methods build the event.
pub trait EventSink: Send + Sync {
    /// Deliver an event. Must not block.
    fn emit(&self, event: Event);

    /// A peer joined the league.
    fn peer_registered(&self, peer: &PeerRecord) {
        self.emit(Event::new(
            PEER_REGISTERED,
            json!({ "peer_id": peer.id, "role": peer.role, "endpoint": peer.endpoint }),
        ));
    }

    /// Both players accepted and the first round is about to start.
    fn match_started(&self, record: &MatchRecord) {
        self.emit(Event::new(
            MATCH_STARTED,
            json!({
                "match_id": record.match_id,
                "round_number": record.round_number,
                "player_a_id": record.player_a_id,
                "player_b_id": record.player_b_id,
                "referee_id": record.referee_id,
            }),
        ));
    }

    /// A round was resolved and recorded.
    fn round_completed(&self, match_id: &str, round: &RoundResult) {
        self.emit(Event::new(
            ROUND_COMPLETED,
            json!({ "match_id": match_id, "round": to_payload(round) }),
        ));
    }

    /// A match was sealed.
    fn match_completed(&self, record: &MatchRecord) {
        self.emit(Event::new(MATCH_COMPLETED, to_payload(record)));
    }

    /// The detector ejected a peer.
    fn peer_ejected(&self, score: &BehaviorScore) {
        self.emit(Event::new(PEER_EJECTED, to_payload(score)));
    }

    /// The standings table changed.
    fn standings_updated(&self, standings: &[StandingsEntry]) {
        self.emit(Event::new(
            STANDINGS_UPDATED,
            json!({ "standings": to_payload(&standings) }),
        ));
    }
}

/// Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}

/// Logs every event at `info` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: Event) {
        info!(event_type = %event.event_type, payload = %event.payload, "event");
    }
}

/// Forwards events to an unbounded channel. Events are silently dropped once the receiver
/// is gone.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    /// Sink and the receiving end.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

/// Prints match results and standings to stdout as they happen.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl EventSink for ConsoleSink {
    fn emit(&self, _event: Event) {}

    fn match_completed(&self, record: &MatchRecord) {
        let reason = record
            .termination
            .map(|r| format!("{r:?}"))
            .unwrap_or_default();
        // clear line, green match, scores, red termination
        println!(
            "\x1b[2K\x1b[32m{record}: \x1b[39m{}-{} \x1b[31m{:?} {reason}\x1b[39m",
            record.scores[0], record.scores[1], record.state
        );
    }

    fn standings_updated(&self, standings: &[StandingsEntry]) {
        let line = standings
            .iter()
            .map(|e| format!("{} {}pts", e.peer_id, e.points))
            .collect::<Vec<_>>()
            .join(", ");
        println!("\x1b[2K\x1b[33mStandings:\x1b[39m {line}");
    }
}

/// Delivers each event to several sinks.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    /// Empty fan-out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: Event) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }

    fn peer_registered(&self, peer: &PeerRecord) {
        self.sinks.iter().for_each(|s| s.peer_registered(peer));
    }

    fn match_started(&self, record: &MatchRecord) {
        self.sinks.iter().for_each(|s| s.match_started(record));
    }

    fn round_completed(&self, match_id: &str, round: &RoundResult) {
        self.sinks
            .iter()
            .for_each(|s| s.round_completed(match_id, round));
    }

    fn match_completed(&self, record: &MatchRecord) {
        self.sinks.iter().for_each(|s| s.match_completed(record));
    }

    fn peer_ejected(&self, score: &BehaviorScore) {
        self.sinks.iter().for_each(|s| s.peer_ejected(score));
    }

    fn standings_updated(&self, standings: &[StandingsEntry]) {
        self.sinks.iter().for_each(|s| s.standings_updated(standings));
    }
}
