//! Request/response RPC to remote peers.
//!
//! [`Transport::call`] never fails: every outcome, including circuit fast-fails and exhausted
//! retries, comes back as a [`Reply`]. Each call is reported to the [`OutcomeObserver`] (the
//! misbehaviour detector) under the remote peer's id. [`Transport::notify`] is the same
//! pipeline without observation, for post-match bookkeeping.
//!
//! The `timeout` of a call is its whole budget: every attempt gets what is left of it and no
//! retry starts once it is spent.

mod circuit_breaker;
mod retry;
mod wire;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, trace, warn};

pub use circuit_breaker::{BreakerSettings, CircuitState};
pub use retry::RetryPolicy;
pub use wire::{HttpWire, LoopbackWire, Wire};

use crate::configuration::Configuration;
use crate::detector::{OutcomeKind, OutcomeObserver};
use crate::error::TransportError;
use crate::protocol::{Method, ResponseShape, RpcRequest, RpcResponse};
use crate::striped::Striped;
use circuit_breaker::{Admission, CircuitBreaker};

/// How a call ended, from the caller's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Well-formed `result`.
    Valid(Value),
    /// Budget spent without an answer.
    TimedOut,
    /// Malformed answer, or an error object from the remote side.
    Invalid(String),
    /// Connection refused or circuit open.
    Unreachable,
}

impl Reply {
    /// Outcome kind reported to the detector.
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Reply::Valid(_) => OutcomeKind::Success,
            Reply::TimedOut => OutcomeKind::Timeout,
            Reply::Invalid(_) => OutcomeKind::Invalid,
            Reply::Unreachable => OutcomeKind::Unreachable,
        }
    }

    /// The result value, if any.
    pub fn into_value(self) -> Option<Value> {
        match self {
            Reply::Valid(v) => Some(v),
            _ => None,
        }
    }
}

impl From<TransportError> for Reply {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout => Reply::TimedOut,
            TransportError::Connect(_) | TransportError::CircuitOpen(_) => Reply::Unreachable,
            TransportError::Malformed(m) => Reply::Invalid(m),
            TransportError::Remote { code, message } => {
                Reply::Invalid(format!("remote error {code}: {message}"))
            }
        }
    }
}

/// A call's reply with its timing.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    /// What came back.
    pub reply: Reply,
    /// Wall time of the whole call, retries included.
    pub latency: Duration,
    /// Attempts made (0 when the circuit refused the first one).
    pub attempts: u32,
}

impl CallOutcome {
    /// Latency in whole milliseconds.
    pub fn latency_ms(&self) -> u64 {
        self.latency.as_millis() as u64
    }
}

/// Transport to every peer of the league.
pub struct Transport {
    wire: Arc<dyn Wire>,
    retry: RetryPolicy,
    breaker: BreakerSettings,
    circuits: Striped<CircuitBreaker>,
    observer: Option<Arc<dyn OutcomeObserver>>,
}

impl Transport {
    /// Transport over `wire` with default retry and breaker settings and no observer.
    pub fn new(wire: Arc<dyn Wire>) -> Self {
        Self {
            wire,
            retry: RetryPolicy::default(),
            breaker: BreakerSettings::default(),
            circuits: Striped::default(),
            observer: None,
        }
    }

    /// Transport tuned by `config`.
    pub fn from_config(wire: Arc<dyn Wire>, config: &Configuration) -> Self {
        Self::new(wire)
            .with_retry(RetryPolicy {
                max_retries: config.max_retries,
                base: config.backoff_base,
                max: config.backoff_max,
            })
            .with_breaker(BreakerSettings {
                failure_threshold: config.failure_threshold,
                cooldown: config.circuit_cooldown,
            })
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the breaker settings. Only affects circuits created afterwards.
    pub fn with_breaker(mut self, breaker: BreakerSettings) -> Self {
        self.breaker = breaker;
        self
    }

    /// Report every observed call to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn OutcomeObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Call `method` on the peer `peer_id` listening at `endpoint`, within `timeout`.
    /// The outcome is reported to the observer.
    pub async fn call(
        &self,
        peer_id: &str,
        endpoint: &str,
        method: Method,
        params: Value,
        timeout: Duration,
    ) -> CallOutcome {
        let outcome = self.exchange(endpoint, method, params, timeout).await;
        if let Some(observer) = &self.observer {
            observer.observe(peer_id, outcome.reply.kind(), outcome.latency_ms());
        }
        trace!(peer = peer_id, %method, reply = ?outcome.reply, latency = ?outcome.latency, "call");
        outcome
    }

    /// Same as [`Transport::call`], but the outcome is not reported to the observer.
    pub async fn notify(
        &self,
        endpoint: &str,
        method: Method,
        params: Value,
        timeout: Duration,
    ) -> CallOutcome {
        self.exchange(endpoint, method, params, timeout).await
    }

    /// Whether `endpoint` answers a `health_check` within `timeout`. Not observed.
    pub async fn health_check(&self, endpoint: &str, timeout: Duration) -> bool {
        let outcome = self
            .notify(endpoint, Method::HealthCheck, Value::Object(Default::default()), timeout)
            .await;
        matches!(outcome.reply, Reply::Valid(_))
    }

    /// Circuit state of `endpoint` right now.
    pub fn circuit_state(&self, endpoint: &str) -> CircuitState {
        let now = Instant::now();
        self.circuits.with(endpoint, |circuit| {
            circuit.map_or(CircuitState::Closed, |c| c.state(now))
        })
    }

    async fn exchange(
        &self,
        endpoint: &str,
        method: Method,
        params: Value,
        timeout: Duration,
    ) -> CallOutcome {
        let started = Instant::now();
        let deadline = started + timeout;
        let request = RpcRequest::new(method, params);
        let (result, attempts) = match serde_json::to_string(&request) {
            Ok(body) => self.attempt_loop(endpoint, &request.id, body, deadline).await,
            Err(e) => (Err(TransportError::Malformed(e.to_string())), 0),
        };
        let reply = match result {
            Ok(value) => Reply::Valid(value),
            Err(e) => {
                debug!(endpoint, %method, error = %e, attempts, "call failed");
                Reply::from(e)
            }
        };
        CallOutcome {
            reply,
            latency: started.elapsed(),
            attempts,
        }
    }

    async fn attempt_loop(
        &self,
        endpoint: &str,
        request_id: &str,
        body: String,
        deadline: Instant,
    ) -> (Result<Value, TransportError>, u32) {
        let mut attempts = 0;
        loop {
            let admission = self.circuits.upsert(
                endpoint,
                || CircuitBreaker::new(self.breaker),
                |c| c.admit(Instant::now()),
            );
            if admission == Admission::Rejected {
                return (Err(TransportError::CircuitOpen(endpoint.to_string())), attempts);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // a probe that never goes out must not keep the circuit half-open
                if admission == Admission::Probe {
                    self.record(endpoint, &Err(TransportError::Timeout));
                }
                return (Err(TransportError::Timeout), attempts);
            }

            attempts += 1;
            let result = match tokio::time::timeout(
                remaining,
                self.wire.post(endpoint, body.clone(), remaining),
            )
            .await
            {
                Ok(sent) => sent.and_then(|raw| decode_response(&raw, request_id)),
                Err(_) => Err(TransportError::Timeout),
            };
            self.record(endpoint, &result);

            match result {
                Err(e) if self.retry.should_retry(attempts, &e) => {
                    let delay = self.retry.backoff(attempts);
                    if Instant::now() + delay >= deadline {
                        return (Err(e), attempts);
                    }
                    debug!(endpoint, attempt = attempts, ?delay, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return (other, attempts),
            }
        }
    }

    fn record(&self, endpoint: &str, result: &Result<Value, TransportError>) {
        let now = Instant::now();
        self.circuits.upsert(
            endpoint,
            || CircuitBreaker::new(self.breaker),
            |c| match result {
                Err(e) if e.is_transient() => c.on_failure(now),
                _ => c.on_success(),
            },
        );
    }
}

/// Decode a response body answering `request_id`.
fn decode_response(raw: &str, request_id: &str) -> Result<Value, TransportError> {
    let response: RpcResponse =
        serde_json::from_str(raw).map_err(|e| TransportError::Malformed(e.to_string()))?;
    if response.id != request_id {
        warn!(expected = request_id, got = %response.id, "response id mismatch");
        return Err(TransportError::Malformed(format!(
            "response id '{}' does not match request",
            response.id
        )));
    }
    response.into_result().map_err(|shape| match shape {
        ResponseShape::Error(e) => TransportError::Remote {
            code: e.code,
            message: e.message,
        },
        ResponseShape::Empty => TransportError::Malformed("neither result nor error".to_string()),
    })
}
