//! A league player: answers invitations and move requests with a [`MoveStrategy`].
//!
//! [`PlayerAgent`] is an [`RpcHandler`]; serve it with
//! [`RpcServer`](crate::rpc_server::RpcServer) or bind it on a
//! [`LoopbackWire`](crate::transport::LoopbackWire), then register it with the league manager.

use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::ProtocolError;
use crate::game_interface::{Move, MoveStrategy, Side};
use crate::protocol::{
    decode_params, encode, Ack, HealthStatus, HeartbeatParams, HeartbeatResult,
    InviteMatchParams, InviteMatchResult, Method, RegisterPeerParams, RegisterPeerResult,
    ReportResultParams, RequestMoveParams, RequestMoveResult,
};
use crate::registry::{PeerId, PeerStatus, Role};
use crate::rpc_server::RpcHandler;
use crate::transport::{Reply, Transport};

/// What the manager handed out at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Assigned id.
    pub peer_id: PeerId,
    /// Token every manager/referee call must carry.
    pub auth_token: String,
}

#[derive(Debug, Clone)]
struct Seat {
    side: Side,
    opponent_id: PeerId,
}

/// A player peer driven by a [`MoveStrategy`].
pub struct PlayerAgent {
    name: String,
    strategy: Arc<dyn MoveStrategy>,
    credentials: RwLock<Option<Credentials>>,
    accept_invitations: AtomicBool,
    seats: Mutex<HashMap<String, Seat>>,
    results: Mutex<VecDeque<ReportResultParams>>,
    match_number: AtomicUsize,
}

impl PlayerAgent {
    /// Most recent results kept by [`PlayerAgent::results`].
    pub const RESULTS_KEPT: usize = 256;

    /// Unregistered agent playing `strategy`. Accepts every invitation by default.
    pub fn new(name: impl Into<String>, strategy: Arc<dyn MoveStrategy>) -> Self {
        Self {
            name: name.into(),
            strategy,
            credentials: RwLock::new(None),
            accept_invitations: AtomicBool::new(true),
            seats: Mutex::new(HashMap::new()),
            results: Mutex::new(VecDeque::new()),
            match_number: AtomicUsize::new(0),
        }
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Credentials received at registration, if any.
    pub fn credentials(&self) -> Option<Credentials> {
        self.credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Use credentials obtained out of band. Until credentials are set, calls carrying any
    /// token are accepted.
    pub fn set_credentials(&self, credentials: Credentials) {
        *self
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(credentials);
    }

    /// Accept or decline the next invitations.
    pub fn set_accept_invitations(&self, accept: bool) {
        self.accept_invitations.store(accept, Ordering::Relaxed);
    }

    /// The last [`Self::RESULTS_KEPT`] results reported by referees, oldest first.
    pub fn results(&self) -> Vec<ReportResultParams> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Number of invitations accepted.
    pub fn matches_joined(&self) -> usize {
        self.match_number.load(Ordering::Relaxed)
    }

    /// Register with the manager at `manager_endpoint`, advertising `own_endpoint`.
    pub async fn register_with(
        &self,
        transport: &Transport,
        manager_endpoint: &str,
        own_endpoint: &str,
        timeout: Duration,
    ) -> anyhow::Result<Credentials> {
        let params = encode(&RegisterPeerParams {
            role: Role::Player,
            endpoint: own_endpoint.to_string(),
            display_name: Some(self.name.clone()),
        })?;
        let outcome = transport
            .notify(manager_endpoint, Method::RegisterPeer, params, timeout)
            .await;
        let result: RegisterPeerResult = decode_params(expect_valid(outcome.reply)?)
            .context("unexpected registration answer")?;
        let credentials = Credentials {
            peer_id: result.peer_id,
            auth_token: result.auth_token,
        };
        info!(agent = %self, peer = %credentials.peer_id, "registered");
        self.set_credentials(credentials.clone());
        Ok(credentials)
    }

    /// Send one heartbeat to the manager.
    pub async fn heartbeat(
        &self,
        transport: &Transport,
        manager_endpoint: &str,
        timeout: Duration,
    ) -> anyhow::Result<PeerStatus> {
        let Some(credentials) = self.credentials() else {
            bail!("{self} is not registered");
        };
        let params = encode(&HeartbeatParams {
            peer_id: credentials.peer_id,
            auth_token: credentials.auth_token,
        })?;
        let outcome = transport
            .notify(manager_endpoint, Method::Heartbeat, params, timeout)
            .await;
        let result: HeartbeatResult = decode_params(expect_valid(outcome.reply)?)?;
        Ok(result.status)
    }

    fn authorize(&self, token: &str) -> Result<(), ProtocolError> {
        match self.credentials() {
            Some(credentials) if credentials.auth_token != token => {
                warn!(agent = %self, "call with a wrong auth token");
                Err(ProtocolError::Unauthorized)
            }
            _ => Ok(()),
        }
    }

    fn invite(&self, params: InviteMatchParams) -> Result<InviteMatchResult, ProtocolError> {
        self.authorize(&params.auth_token)?;
        let accepted = self.accept_invitations.load(Ordering::Relaxed);
        if accepted {
            self.match_number.fetch_add(1, Ordering::Relaxed);
            self.seats
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(
                    params.match_id.clone(),
                    Seat {
                        side: params.side,
                        opponent_id: params.opponent_id.clone(),
                    },
                );
        }
        debug!(agent = %self, match_id = %params.match_id, opponent = %params.opponent_id, accepted, "invitation");
        Ok(InviteMatchResult { accepted })
    }

    async fn play(&self, params: RequestMoveParams) -> Result<RequestMoveResult, ProtocolError> {
        self.authorize(&params.auth_token)?;
        let seat = self
            .seats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&params.match_id)
            .cloned();
        if let Some(seat) = &seat {
            if seat.side != params.side {
                warn!(agent = %self, match_id = %params.match_id, "move requested for the other side");
            }
        }

        let strategy = self.strategy.clone();
        let RequestMoveParams {
            game_id,
            round,
            side,
            opponent_history,
            timeout_ms,
            ..
        } = params;
        // strategies are synchronous and may be slow
        let decision = tokio::task::spawn_blocking(move || {
            strategy.decide(&game_id, round, side, &opponent_history)
        });
        let value: Move = match tokio::time::timeout(Duration::from_millis(timeout_ms), decision).await {
            Ok(Ok(Ok(value))) => value,
            Ok(Ok(Err(e))) => return Err(ProtocolError::Internal(format!("strategy failed: {e:#}"))),
            Ok(Err(e)) => return Err(ProtocolError::Internal(format!("strategy panicked: {e}"))),
            Err(_) => return Err(ProtocolError::Internal("strategy too slow".into())),
        };
        debug!(agent = %self, round, value, "move");
        Ok(RequestMoveResult { value })
    }

    fn report(&self, params: ReportResultParams) -> Result<Ack, ProtocolError> {
        self.authorize(&params.auth_token)?;
        let seat = self
            .seats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&params.match_id);
        let opponent = seat.map(|s| s.opponent_id).unwrap_or_default();
        info!(
            agent = %self,
            match_id = %params.match_id,
            %opponent,
            state = ?params.state,
            winner = ?params.winner,
            "match over"
        );
        let mut results = self.results.lock().unwrap_or_else(PoisonError::into_inner);
        if results.len() == Self::RESULTS_KEPT {
            results.pop_front();
        }
        results.push_back(params);
        Ok(Ack { ok: true })
    }
}

fn expect_valid(reply: Reply) -> anyhow::Result<Value> {
    match reply {
        Reply::Valid(value) => Ok(value),
        Reply::Invalid(reason) => Err(anyhow!("manager rejected the call: {reason}")),
        Reply::TimedOut => Err(anyhow!("manager did not answer in time")),
        Reply::Unreachable => Err(anyhow!("manager unreachable")),
    }
}

impl Display for PlayerAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.credentials() {
            Some(c) => write!(f, "{} ({})", self.name, c.peer_id),
            None => write!(f, "{}", self.name),
        }
    }
}

impl RpcHandler for PlayerAgent {
    fn handle(&self, method: Method, params: Value) -> BoxFuture<'_, Result<Value, ProtocolError>> {
        Box::pin(async move {
            match method {
                Method::InviteMatch => encode(&self.invite(decode_params(params)?)?),
                Method::RequestMove => encode(&self.play(decode_params(params)?).await?),
                Method::ReportResult => encode(&self.report(decode_params(params)?)?),
                Method::HealthCheck => encode(&HealthStatus::ok()),
                Method::RegisterPeer | Method::Heartbeat => {
                    Err(ProtocolError::Unsupported(method.to_string()))
                }
            }
        })
    }
}

#[cfg(test)]
mod agent_tests {
    use serde_json::json;

    use super::*;
    use crate::match_record::MatchState;
    use crate::strategy::FixedStrategy;

    fn agent() -> PlayerAgent {
        let agent = PlayerAgent::new("fixed-3", Arc::new(FixedStrategy(3)));
        agent.set_credentials(Credentials {
            peer_id: "P0001".into(),
            auth_token: "secret".into(),
        });
        agent
    }

    fn move_request(token: &str) -> Value {
        json!({
            "match_id": "m1",
            "game_id": "even_odd",
            "round": 1,
            "side": "a",
            "opponent_history": [],
            "timeout_ms": 1000,
            "auth_token": token,
        })
    }

    #[tokio::test]
    async fn plays_its_strategy() {
        let agent = agent();
        let v = agent
            .handle(Method::RequestMove, move_request("secret"))
            .await
            .unwrap();
        assert_eq!(v["move"], 3);
    }

    #[tokio::test]
    async fn wrong_token_is_refused() {
        let agent = agent();
        let err = agent
            .handle(Method::RequestMove, move_request("guess"))
            .await
            .unwrap_err();
        assert_eq!(err, ProtocolError::Unauthorized);
    }

    #[tokio::test]
    async fn invitations_and_results() {
        let agent = agent();
        let invite = json!({
            "match_id": "m1",
            "game_id": "even_odd",
            "side": "b",
            "opponent_id": "P0002",
            "total_rounds": 5,
            "auth_token": "secret",
        });
        let v = agent.handle(Method::InviteMatch, invite.clone()).await.unwrap();
        assert_eq!(v["accepted"], true);

        agent.set_accept_invitations(false);
        let v = agent.handle(Method::InviteMatch, invite).await.unwrap();
        assert_eq!(v["accepted"], false);
        assert_eq!(agent.matches_joined(), 1);

        let report = encode(&ReportResultParams {
            match_id: "m1".into(),
            state: MatchState::Completed,
            winner: Some("P0001".into()),
            scores: [3, 1],
            rounds_played: 4,
            auth_token: "secret".into(),
        })
        .unwrap();
        let v = agent.handle(Method::ReportResult, report).await.unwrap();
        assert_eq!(v["ok"], true);
        assert_eq!(agent.results().len(), 1);
    }

    #[tokio::test]
    async fn only_recent_results_are_kept() {
        let agent = agent();
        for i in 0..PlayerAgent::RESULTS_KEPT + 10 {
            let report = encode(&ReportResultParams {
                match_id: format!("m{i}"),
                state: MatchState::Completed,
                winner: None,
                scores: [1, 1],
                rounds_played: 2,
                auth_token: "secret".into(),
            })
            .unwrap();
            agent.handle(Method::ReportResult, report).await.unwrap();
        }
        let results = agent.results();
        assert_eq!(results.len(), PlayerAgent::RESULTS_KEPT);
        assert_eq!(results[0].match_id, "m10");
        assert_eq!(
            results.last().map(|r| r.match_id.as_str()),
            Some(format!("m{}", PlayerAgent::RESULTS_KEPT + 9).as_str())
        );
    }

    #[tokio::test]
    async fn manager_verbs_are_not_served() {
        let agent = agent();
        let err = agent.handle(Method::Heartbeat, json!({})).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Unsupported(_)));
    }
}
