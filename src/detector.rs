//! Heuristic misbehaviour scoring.
//!
//! Every observed call outcome can trigger one of three signatures, each worth one point:
//!
//! - **timeout**: the call timed out, the peer was unreachable, or it answered slower than the
//!   move timeout;
//! - **invalid**: the payload failed schema or domain validation;
//! - **timing anomaly**: a successful answer whose latency deviates from the peer's rolling mean
//!   by more than `anomaly_sigma` standard deviations (and more than the absolute floor), once
//!   `min_samples` latencies are known.
//!
//! When the composite score reaches the ejection threshold the peer is ejected: the registry
//! record becomes `Ejected`, a `peer.ejected` event is emitted and the score is frozen.
//! Ejection is terminal for the run.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::configuration::Configuration;
use crate::constraints::Constraints;
use crate::events::EventSink;
use crate::registry::{PeerId, Registry};
use crate::striped::Striped;

/// What a single call to a peer looked like from the caller's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeKind {
    /// Well-formed answer.
    Success,
    /// No answer within the budget.
    Timeout,
    /// Connection refused, or the circuit to the peer is open.
    Unreachable,
    /// Answer failed schema or domain validation.
    Invalid,
}

/// Anything that wants to hear about call outcomes, keyed by peer id.
///
/// Implementations must not block.
pub trait OutcomeObserver: Send + Sync {
    /// Record one outcome.
    fn observe(&self, peer_id: &str, kind: OutcomeKind, latency_ms: u64);
}

/// Public view of a peer's behaviour.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviorScore {
    /// Scored peer.
    pub peer_id: PeerId,
    /// Timeout signatures.
    pub timeout_count: u32,
    /// Invalid payload signatures.
    pub invalid_count: u32,
    /// Timing anomaly signatures.
    pub timing_anomaly_count: u32,
    /// Sum of all signatures.
    pub composite_score: u32,
    /// Threshold reached.
    pub ejected: bool,
}

impl BehaviorScore {
    fn empty(peer_id: &str) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            ..Default::default()
        }
    }
}

/// Detector tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorSettings {
    /// Composite score at which a peer is ejected.
    pub threshold: u32,
    /// Answers slower than this count as a timeout.
    pub move_timeout: Duration,
    /// Deviation, in standard deviations, that counts as an anomaly.
    pub anomaly_sigma: f64,
    /// Deviations below this are never anomalies.
    pub anomaly_floor: Duration,
    /// Latencies needed before the anomaly signature can fire.
    pub min_samples: usize,
    /// Rolling window size.
    pub window: usize,
}

impl DetectorSettings {
    /// Settings taken from the league configuration and constraints.
    pub fn from_parts(config: &Configuration, constraints: &Constraints) -> Self {
        Self {
            threshold: config.ejection_threshold,
            move_timeout: constraints.move_timeout,
            anomaly_sigma: config.anomaly_sigma,
            anomaly_floor: config.anomaly_floor,
            min_samples: config.anomaly_min_samples,
            window: config.latency_window,
        }
    }
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self::from_parts(&Configuration::default(), &Constraints::default())
    }
}

struct PeerBehavior {
    score: BehaviorScore,
    latencies: VecDeque<f64>,
}

enum Signature {
    Timeout,
    Invalid,
    Anomaly,
}

/// Scores peers and ejects them at threshold.
///
/// Scores live in a lock-striped table; observing never awaits and never holds a lock while
/// talking to the registry or the event sink.
pub struct ByzantineDetector {
    settings: DetectorSettings,
    scores: Striped<PeerBehavior>,
    registry: Arc<Registry>,
    events: Arc<dyn EventSink>,
}

impl ByzantineDetector {
    /// New detector ejecting through `registry` and reporting to `events`.
    pub fn new(
        settings: DetectorSettings,
        registry: Arc<Registry>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            settings,
            scores: Striped::default(),
            registry,
            events,
        }
    }

    /// Settings in use.
    pub fn settings(&self) -> &DetectorSettings {
        &self.settings
    }

    /// Record one call outcome for `peer_id`. Ignored once the peer is ejected.
    pub fn observe(&self, peer_id: &str, kind: OutcomeKind, latency_ms: u64) {
        let settings = self.settings;
        let ejected_now = self.scores.upsert(
            peer_id,
            || PeerBehavior {
                score: BehaviorScore::empty(peer_id),
                latencies: VecDeque::with_capacity(settings.window),
            },
            |peer| {
                if peer.score.ejected {
                    return None;
                }
                let signature = classify(&settings, peer, kind, latency_ms)?;
                match signature {
                    Signature::Timeout => peer.score.timeout_count += 1,
                    Signature::Invalid => peer.score.invalid_count += 1,
                    Signature::Anomaly => peer.score.timing_anomaly_count += 1,
                }
                peer.score.composite_score += 1;
                debug!(
                    peer = peer_id,
                    ?kind,
                    latency_ms,
                    composite = peer.score.composite_score,
                    "behaviour signature"
                );
                if peer.score.composite_score >= settings.threshold {
                    peer.score.ejected = true;
                    Some(peer.score.clone())
                } else {
                    None
                }
            },
        );

        if let Some(score) = ejected_now {
            warn!(
                peer = peer_id,
                timeouts = score.timeout_count,
                invalid = score.invalid_count,
                anomalies = score.timing_anomaly_count,
                "peer ejected"
            );
            self.registry.mark_ejected(peer_id);
            self.events.peer_ejected(&score);
        }
    }

    /// Whether the peer reached the threshold, or was already ejected in the registry
    /// (e.g. restored from a snapshot).
    pub fn is_ejected(&self, peer_id: &str) -> bool {
        self.scores
            .with(peer_id, |peer| peer.is_some_and(|p| p.score.ejected))
            || self.registry.is_ejected(peer_id)
    }

    /// Current score; all zeros for a peer never observed.
    pub fn score(&self, peer_id: &str) -> BehaviorScore {
        self.scores.with(peer_id, |peer| match peer {
            Some(peer) => peer.score.clone(),
            None => BehaviorScore::empty(peer_id),
        })
    }

    /// Non-zero scores of registered peers, sorted by peer id.
    pub fn scores(&self) -> Vec<BehaviorScore> {
        self.registry
            .peers()
            .iter()
            .map(|p| self.score(&p.id))
            .filter(|s| s.composite_score > 0)
            .collect()
    }
}

impl OutcomeObserver for ByzantineDetector {
    fn observe(&self, peer_id: &str, kind: OutcomeKind, latency_ms: u64) {
        ByzantineDetector::observe(self, peer_id, kind, latency_ms)
    }
}

/// Signature triggered by this outcome, if any. Successful latencies feed the rolling window.
fn classify(
    settings: &DetectorSettings,
    peer: &mut PeerBehavior,
    kind: OutcomeKind,
    latency_ms: u64,
) -> Option<Signature> {
    match kind {
        OutcomeKind::Timeout | OutcomeKind::Unreachable => Some(Signature::Timeout),
        OutcomeKind::Invalid => Some(Signature::Invalid),
        OutcomeKind::Success if latency_ms as u128 > settings.move_timeout.as_millis() => {
            Some(Signature::Timeout)
        }
        OutcomeKind::Success => {
            let sample = latency_ms as f64;
            let anomalous = is_anomalous(settings, &peer.latencies, sample);
            peer.latencies.push_back(sample);
            while peer.latencies.len() > settings.window.max(1) {
                peer.latencies.pop_front();
            }
            anomalous.then_some(Signature::Anomaly)
        }
    }
}

fn is_anomalous(settings: &DetectorSettings, window: &VecDeque<f64>, sample: f64) -> bool {
    if window.len() < settings.min_samples.max(2) {
        return false;
    }
    let n = window.len() as f64;
    let mean = window.iter().sum::<f64>() / n;
    let variance = window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let limit = (settings.anomaly_sigma * variance.sqrt())
        .max(settings.anomaly_floor.as_secs_f64() * 1000.0);
    (sample - mean).abs() > limit
}
