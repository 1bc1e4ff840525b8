//! JSON-RPC style wire protocol spoken between the league manager, referees and players.
//!
//! Every call is a `POST` of a [`RpcRequest`] envelope to [`RPC_PATH`] on the peer's
//! endpoint, answered by a [`RpcResponse`] that carries either a `result` or an `error`:
//!
//! ```text
//! Request:  { "version": "2.0", "method": "<verb>", "params": {...}, "id": "<uuid>" }
//! Response: { "version": "2.0", "id": "<uuid>", "result": {...} }
//!         | { "version": "2.0", "id": "<uuid>", "error": {"code": ..., "message": ...} }
//! ```
//!
//! The vocabulary is closed: see [`Method`]. Anything else is answered with
//! [`METHOD_NOT_FOUND`].

use std::{fmt::Display, str::FromStr};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::game_interface::{Move, Side};
use crate::match_record::MatchState;
use crate::registry::{PeerId, PeerStatus, Role};

/// Envelope version accepted and produced by this crate.
pub const PROTOCOL_VERSION: &str = "2.0";
/// HTTP path every peer serves its RPC endpoint on.
pub const RPC_PATH: &str = "/mcp";

/// Body is not valid JSON.
pub const PARSE_ERROR: i64 = -32700;
/// JSON is not a valid envelope.
pub const INVALID_REQUEST: i64 = -32600;
/// Unknown verb.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Params do not match the verb.
pub const INVALID_PARAMS: i64 = -32602;
/// Handler failure.
pub const INTERNAL_ERROR: i64 = -32603;
/// Bad or missing auth token.
pub const UNAUTHORIZED: i64 = -32001;
/// Known verb not served by this role.
pub const UNSUPPORTED_METHOD: i64 = -32002;

/// The verbs of the league protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Peer -> manager: join the league.
    RegisterPeer,
    /// Referee -> player: join a match.
    InviteMatch,
    /// Referee -> player: play one round.
    RequestMove,
    /// Referee -> player: final outcome of a match.
    ReportResult,
    /// Anyone -> anyone: liveness probe.
    HealthCheck,
    /// Peer -> manager: keep-alive.
    Heartbeat,
}

impl Method {
    /// Every verb, in wire order.
    pub const ALL: [Method; 6] = [
        Method::RegisterPeer,
        Method::InviteMatch,
        Method::RequestMove,
        Method::ReportResult,
        Method::HealthCheck,
        Method::Heartbeat,
    ];

    /// Wire name of the verb.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::RegisterPeer => "register_peer",
            Method::InviteMatch => "invite_match",
            Method::RequestMove => "request_move",
            Method::ReportResult => "report_result",
            Method::HealthCheck => "health_check",
            Method::Heartbeat => "heartbeat",
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownMethod(s.to_string()))
    }
}

/// Request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Always [`PROTOCOL_VERSION`].
    pub version: String,
    /// Verb name, see [`Method`].
    pub method: String,
    /// Verb-specific parameters.
    #[serde(default)]
    pub params: Value,
    /// Correlation id echoed by the response.
    pub id: String,
}

impl RpcRequest {
    /// New request with a fresh uuid.
    pub fn new(method: Method, params: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            method: method.as_str().to_string(),
            params,
            id: Uuid::new_v4().to_string(),
        }
    }
}

/// Error object of a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    /// JSON-RPC error code.
    pub code: i64,
    /// Human readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Present on responses produced by this crate; tolerated as missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Id of the request being answered.
    pub id: String,
    /// Set on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Set on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    /// Successful response.
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            version: Some(PROTOCOL_VERSION.to_string()),
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// Failed response.
    pub fn failure(id: impl Into<String>, error: impl Into<RpcError>) -> Self {
        Self {
            version: Some(PROTOCOL_VERSION.to_string()),
            id: id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    /// Exactly one of `result` / `error` must be present.
    pub fn into_result(self) -> Result<Value, ResponseShape> {
        match (self.result, self.error) {
            (_, Some(e)) => Err(ResponseShape::Error(e)),
            (Some(v), None) => Ok(v),
            (None, None) => Err(ResponseShape::Empty),
        }
    }
}

/// Why a response did not carry a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseShape {
    /// Remote declared an application error.
    Error(RpcError),
    /// Neither `result` nor `error`.
    Empty,
}

/// Parse a raw request body. On failure returns the request id if one could be
/// recovered, so the error response can still be correlated.
pub fn parse_request(body: &str) -> Result<RpcRequest, (Option<String>, ProtocolError)> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| (None, ProtocolError::Parse(e.to_string())))?;
    let id = value.get("id").and_then(Value::as_str).map(String::from);
    let request: RpcRequest = serde_json::from_value(value)
        .map_err(|e| (id.clone(), ProtocolError::InvalidRequest(e.to_string())))?;
    if request.version != PROTOCOL_VERSION {
        return Err((
            id,
            ProtocolError::InvalidRequest(format!("unsupported version '{}'", request.version)),
        ));
    }
    Ok(request)
}

/// Decode verb params into their typed form.
pub fn decode_params<T: DeserializeOwned>(params: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(params).map_err(|e| ProtocolError::InvalidParams(e.to_string()))
}

/// Encode a typed value for the wire.
pub fn encode<T: Serialize>(value: &T) -> Result<Value, ProtocolError> {
    serde_json::to_value(value).map_err(|e| ProtocolError::Internal(e.to_string()))
}

/// `register_peer` params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPeerParams {
    /// Role the peer wants to play.
    pub role: Role,
    /// `host:port` the peer serves RPC on.
    pub endpoint: String,
    /// Free-form name for logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// `register_peer` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPeerResult {
    /// Id assigned by the manager.
    pub peer_id: PeerId,
    /// Secret the peer must present on heartbeats and expect on invitations.
    pub auth_token: String,
}

/// `heartbeat` params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatParams {
    /// Sender.
    pub peer_id: PeerId,
    /// Token returned at registration.
    pub auth_token: String,
}

/// `heartbeat` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResult {
    /// Status of the peer as seen by the manager.
    pub status: PeerStatus,
}

/// `invite_match` params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteMatchParams {
    /// Match being joined.
    pub match_id: String,
    /// Game being played.
    pub game_id: String,
    /// Side assigned to the invited player.
    pub side: Side,
    /// Opponent id.
    pub opponent_id: PeerId,
    /// Number of rounds scheduled.
    pub total_rounds: u32,
    /// Invited player's auth token.
    pub auth_token: String,
}

/// `invite_match` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteMatchResult {
    /// Whether the player joins.
    pub accepted: bool,
}

/// `request_move` params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMoveParams {
    /// Match being played.
    pub match_id: String,
    /// Game being played.
    pub game_id: String,
    /// 1-based round index.
    pub round: u32,
    /// Side of the player asked to move.
    pub side: Side,
    /// Moves the opponent played in earlier rounds, oldest first.
    pub opponent_history: Vec<Move>,
    /// Time the player has to answer.
    pub timeout_ms: u64,
    /// Player's auth token.
    pub auth_token: String,
}

/// `request_move` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMoveResult {
    /// Chosen move.
    #[serde(rename = "move")]
    pub value: Move,
}

/// `report_result` params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportResultParams {
    /// Match that ended.
    pub match_id: String,
    /// Terminal state.
    pub state: MatchState,
    /// Winner, if any.
    pub winner: Option<PeerId>,
    /// Round wins of side A and side B.
    pub scores: [u32; 2],
    /// Rounds actually played.
    pub rounds_played: u32,
    /// Recipient's auth token.
    pub auth_token: String,
}

/// Generic acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Always true on success.
    pub ok: bool,
}

/// `health_check` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// `"ok"` when serving.
    pub status: String,
}

impl HealthStatus {
    /// Healthy status.
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}
