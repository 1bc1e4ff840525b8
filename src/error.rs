//! Error taxonomy shared by every layer of the league.
//!
//! Only [`AssignmentError`] and [`SchedulerError`] ever reach a caller of the
//! public API as hard errors. [`TransportError`] stays inside the transport,
//! [`ProtocolError`] is turned into a JSON-RPC error object and
//! [`ValidationError`] becomes a detector signature plus a fallback move.

use thiserror::Error;

use crate::protocol::{self, RpcError};
use crate::registry::PeerId;

/// Failure of a single transport attempt.
///
/// Produced by [`Wire`](crate::transport::Wire) implementations and absorbed by the
/// [`Transport`](crate::transport::Transport): callers only ever see a
/// [`Reply`](crate::transport::Reply).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// No answer within the attempt's budget.
    #[error("request timed out")]
    Timeout,

    /// Connection refused or dropped.
    #[error("connection failed: {0}")]
    Connect(String),

    /// Breaker refused the call without any I/O.
    #[error("circuit open for {0}")]
    CircuitOpen(String),

    /// Answer is not a valid response envelope.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Remote answered with an error object.
    #[error("remote error {code}: {message}")]
    Remote {
        /// JSON-RPC error code.
        code: i64,
        /// Remote message.
        message: String,
    },
}

impl TransportError {
    /// Transient failures are retried and count against the circuit breaker.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Timeout | TransportError::Connect(_))
    }
}

/// Malformed envelope or unknown verb. Surfaced to the remote side as a
/// JSON-RPC error, never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Body is not JSON.
    #[error("parse error: {0}")]
    Parse(String),

    /// JSON but not a valid envelope (bad version, missing id, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Verb outside the domain vocabulary.
    #[error("unknown method '{0}'")]
    UnknownMethod(String),

    /// Known verb that this endpoint does not serve.
    #[error("method '{0}' is not served by this peer")]
    Unsupported(String),

    /// Params do not match the verb's schema.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Auth token missing or wrong.
    #[error("unauthorized")]
    Unauthorized,

    /// Handler failed for a reason unrelated to the request shape.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProtocolError {
    /// JSON-RPC error code for this error.
    pub fn code(&self) -> i64 {
        match self {
            ProtocolError::Parse(_) => protocol::PARSE_ERROR,
            ProtocolError::InvalidRequest(_) => protocol::INVALID_REQUEST,
            ProtocolError::UnknownMethod(_) => protocol::METHOD_NOT_FOUND,
            ProtocolError::Unsupported(_) => protocol::UNSUPPORTED_METHOD,
            ProtocolError::InvalidParams(_) => protocol::INVALID_PARAMS,
            ProtocolError::Unauthorized => protocol::UNAUTHORIZED,
            ProtocolError::Internal(_) => protocol::INTERNAL_ERROR,
        }
    }
}

impl From<ProtocolError> for RpcError {
    fn from(e: ProtocolError) -> Self {
        RpcError {
            code: e.code(),
            message: e.to_string(),
            data: None,
        }
    }
}

/// A move that fails schema or domain validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Response did not contain a usable move.
    #[error("malformed move payload: {0}")]
    Malformed(String),

    /// Move outside the game's legal range.
    #[error("move {value} outside legal range {min}..={max}")]
    OutOfRange {
        /// Offending value.
        value: i64,
        /// Smallest legal move.
        min: i64,
        /// Largest legal move.
        max: i64,
    },
}

/// Precondition violated when assigning a match. The match never starts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AssignmentError {
    /// One of the players was already ejected.
    #[error("peer {0} is ejected")]
    PeerEjected(PeerId),

    /// The same peer on both sides.
    #[error("peer {0} cannot play against itself")]
    SelfMatch(PeerId),

    /// Peer is not a registered player.
    #[error("peer {0} is not a registered player")]
    UnknownPeer(PeerId),

    /// A match needs at least one round.
    #[error("a match needs at least one round")]
    NoRounds,
}

/// Registration refused by the registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistrationError {
    /// Ejected peers stay out for the rest of the league run.
    #[error("peer {0} was ejected and cannot re-register")]
    Ejected(PeerId),

    /// Endpoint is not `host:port`.
    #[error("invalid endpoint '{0}', expected host:port")]
    InvalidEndpoint(String),

    /// Registration window closed.
    #[error("registration is closed")]
    Closed,
}

impl From<RegistrationError> for ProtocolError {
    fn from(e: RegistrationError) -> Self {
        match e {
            RegistrationError::InvalidEndpoint(_) => ProtocolError::InvalidParams(e.to_string()),
            RegistrationError::Ejected(_) | RegistrationError::Closed => {
                ProtocolError::Internal(e.to_string())
            }
        }
    }
}

/// Scheduler misuse.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// `run_round` already called for this round.
    #[error("round {0} was already run")]
    DuplicateRound(u32),

    /// Round number not in the generated schedule.
    #[error("round {0} is not part of the schedule")]
    UnknownRound(u32),

    /// `run_round` before `generate_schedule`.
    #[error("no schedule has been generated")]
    NoSchedule,
}
