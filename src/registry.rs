//! Known peers of the league: who they are, where they listen and whether they may play.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ProtocolError, RegistrationError};
use crate::striped::Striped;

/// Identifier assigned to a peer at registration.
pub type PeerId = String;

/// What a peer does in the league.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Plays matches.
    Player,
    /// Provides a slot to run matches.
    Referee,
}

impl Role {
    fn id_prefix(self) -> char {
        match self {
            Role::Player => 'P',
            Role::Referee => 'R',
        }
    }
}

/// Lifecycle of a peer. `Ejected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    /// Registered, no heartbeat yet.
    Registered,
    /// Alive and idle.
    Available,
    /// Currently in a match.
    Busy,
    /// Removed for misbehaviour.
    Ejected,
}

/// A registered peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Assigned id (`P0001`, `R0001`, ...).
    pub id: PeerId,
    /// Player or referee.
    pub role: Role,
    /// `host:port` of the peer's RPC server.
    pub endpoint: String,
    /// Shared secret between the manager and this peer.
    pub auth_token: String,
    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Registration time.
    #[serde(with = "time::serde::rfc3339")]
    pub registered_at: OffsetDateTime,
    /// Last sign of life.
    #[serde(with = "time::serde::rfc3339")]
    pub last_heartbeat: OffsetDateTime,
    /// Current status.
    pub status: PeerStatus,
}

impl PeerRecord {
    /// Ejected peers never play again during this run.
    pub fn is_ejected(&self) -> bool {
        self.status == PeerStatus::Ejected
    }
}

impl Display for PeerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{} ({name})", self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Lock-striped table of peers.
///
/// Each peer's record is only ever mutated under its own stripe, so heartbeats and detector
/// ejections for different peers never contend. Registrations are serialized among
/// themselves: one `(role, endpoint)` never gets two ids.
pub struct Registry {
    peers: Striped<PeerRecord>,
    next_id: AtomicU64,
    registration: Mutex<()>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            peers: Striped::default(),
            next_id: AtomicU64::new(1),
            registration: Mutex::new(()),
        }
    }

    /// Register a peer, or refresh an existing registration for the same role and endpoint.
    pub fn register(
        &self,
        role: Role,
        endpoint: &str,
        display_name: Option<String>,
    ) -> Result<PeerRecord, RegistrationError> {
        validate_endpoint(endpoint)?;
        let _registering = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = self
            .peers
            .values()
            .into_iter()
            .find(|p| p.role == role && p.endpoint == endpoint)
        {
            if existing.is_ejected() {
                warn!(peer = %existing.id, "ejected peer tried to register again");
                return Err(RegistrationError::Ejected(existing.id));
            }
            debug!(peer = %existing.id, "re-registration, refreshing heartbeat");
            self.touch(&existing.id);
            return Ok(self.get(&existing.id).unwrap_or(existing));
        }

        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = OffsetDateTime::now_utc();
        let record = PeerRecord {
            id: format!("{}{n:04}", role.id_prefix()),
            role,
            endpoint: endpoint.to_string(),
            auth_token: Uuid::new_v4().to_string(),
            display_name,
            registered_at: now,
            last_heartbeat: now,
            status: PeerStatus::Registered,
        };
        info!(peer = %record, ?role, endpoint, "peer registered");
        self.peers.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    /// Put back a record loaded from a snapshot.
    pub fn restore(&self, record: PeerRecord) {
        let _registering = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let n = record
            .id
            .get(1..)
            .and_then(|digits| digits.parse::<u64>().ok())
            .unwrap_or(0);
        self.next_id.fetch_max(n + 1, Ordering::Relaxed);
        self.peers.insert(record.id.clone(), record);
    }

    /// Copy of a peer's record.
    pub fn get(&self, id: &str) -> Option<PeerRecord> {
        self.peers.get(id)
    }

    /// Authenticated keep-alive from a peer.
    pub fn heartbeat(&self, id: &str, auth_token: &str) -> Result<PeerStatus, ProtocolError> {
        self.peers.with(id, |record| {
            let record = record.ok_or(ProtocolError::Unauthorized)?;
            if record.auth_token != auth_token {
                return Err(ProtocolError::Unauthorized);
            }
            refresh(record);
            Ok(record.status)
        })
    }

    /// Record a sign of life observed by the manager itself (e.g. a successful health check).
    pub fn touch(&self, id: &str) -> bool {
        self.peers.with(id, |record| match record {
            Some(record) => {
                refresh(record);
                true
            }
            None => false,
        })
    }

    /// Change a peer's status. `Ejected` is sticky: returns false and changes nothing for
    /// an ejected or unknown peer.
    pub fn set_status(&self, id: &str, status: PeerStatus) -> bool {
        self.peers.with(id, |record| match record {
            Some(record) if !record.is_ejected() => {
                record.status = status;
                true
            }
            _ => false,
        })
    }

    /// Mark a peer as ejected. Returns true only the first time.
    pub fn mark_ejected(&self, id: &str) -> bool {
        self.peers.with(id, |record| match record {
            Some(record) if !record.is_ejected() => {
                record.status = PeerStatus::Ejected;
                true
            }
            _ => false,
        })
    }

    /// Whether the peer is known and ejected.
    pub fn is_ejected(&self, id: &str) -> bool {
        self.peers
            .with(id, |record| record.is_some_and(|r| r.is_ejected()))
    }

    /// All peers, sorted by id.
    pub fn peers(&self) -> Vec<PeerRecord> {
        let mut peers = self.peers.values();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// Non-ejected peers of a role, sorted by id.
    pub fn active(&self, role: Role) -> Vec<PeerRecord> {
        self.peers()
            .into_iter()
            .filter(|p| p.role == role && !p.is_ejected())
            .collect()
    }

    /// Non-ejected peers whose last sign of life is older than `max_age`.
    pub fn stale_peers(&self, max_age: Duration) -> Vec<PeerId> {
        let now = OffsetDateTime::now_utc();
        self.peers()
            .into_iter()
            .filter(|p| !p.is_ejected() && now - p.last_heartbeat > max_age)
            .map(|p| p.id)
            .collect()
    }

    /// Number of known peers, ejected included.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// No peer registered yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the id is known.
    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains(id)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn refresh(record: &mut PeerRecord) {
    record.last_heartbeat = OffsetDateTime::now_utc();
    if record.status == PeerStatus::Registered {
        record.status = PeerStatus::Available;
    }
}

fn validate_endpoint(endpoint: &str) -> Result<(), RegistrationError> {
    let invalid = || RegistrationError::InvalidEndpoint(endpoint.to_string());
    let (host, port) = endpoint.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || host.contains('/') || port.parse::<u16>().is_err() {
        return Err(invalid());
    }
    Ok(())
}

#[cfg(test)]
mod registry_tests {
    use std::sync::{Arc, Barrier};

    use super::*;

    #[test]
    fn register_assigns_ids_per_role() {
        let registry = Registry::new();
        let p = registry.register(Role::Player, "127.0.0.1:9001", None).unwrap();
        let r = registry.register(Role::Referee, "127.0.0.1:9100", None).unwrap();
        assert!(p.id.starts_with('P'));
        assert!(r.id.starts_with('R'));
        assert_eq!(p.status, PeerStatus::Registered);
        assert_ne!(p.auth_token, r.auth_token);
        assert_eq!(registry.active(Role::Player).len(), 1);
    }

    #[test]
    fn re_registration_is_idempotent() {
        let registry = Registry::new();
        let first = registry.register(Role::Player, "localhost:9001", None).unwrap();
        let second = registry.register(Role::Player, "localhost:9001", None).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.auth_token, second.auth_token);
        assert_eq!(second.status, PeerStatus::Available);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn bad_endpoints_are_refused() {
        let registry = Registry::new();
        for bad in ["nohost", ":80", "host:notaport", "http://host:80/x", "host:70000"] {
            assert!(registry.register(Role::Player, bad, None).is_err(), "{bad}");
        }
    }

    #[test]
    fn heartbeat_requires_token() {
        let registry = Registry::new();
        let p = registry.register(Role::Player, "localhost:9001", None).unwrap();
        assert_eq!(
            registry.heartbeat(&p.id, "wrong"),
            Err(ProtocolError::Unauthorized)
        );
        assert_eq!(
            registry.heartbeat("P9999", &p.auth_token),
            Err(ProtocolError::Unauthorized)
        );
        assert_eq!(
            registry.heartbeat(&p.id, &p.auth_token),
            Ok(PeerStatus::Available)
        );
    }

    #[test]
    fn ejection_is_sticky() {
        let registry = Registry::new();
        let p = registry.register(Role::Player, "localhost:9001", None).unwrap();
        assert!(registry.mark_ejected(&p.id));
        assert!(!registry.mark_ejected(&p.id));
        assert!(!registry.set_status(&p.id, PeerStatus::Available));
        assert!(registry.is_ejected(&p.id));
        assert!(registry.active(Role::Player).is_empty());
        assert_eq!(
            registry.register(Role::Player, "localhost:9001", None),
            Err(RegistrationError::Ejected(p.id.clone()))
        );
        assert_eq!(
            registry.heartbeat(&p.id, &p.auth_token),
            Ok(PeerStatus::Ejected)
        );
    }

    #[test]
    fn restore_keeps_ids_unique() {
        let registry = Registry::new();
        let p = registry.register(Role::Player, "localhost:9001", None).unwrap();

        let fresh = Registry::new();
        fresh.restore(PeerRecord {
            id: "P0041".into(),
            ..p
        });
        let next = fresh.register(Role::Player, "localhost:9002", None).unwrap();
        assert_eq!(next.id, "P0042");
    }

    #[test]
    fn concurrent_registrations_share_one_id() {
        for _ in 0..50 {
            let registry = Arc::new(Registry::new());
            let barrier = Arc::new(Barrier::new(8));
            let handles = (0..8)
                .map(|_| {
                    let registry = registry.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        registry.register(Role::Player, "host:9000", None).unwrap()
                    })
                })
                .collect::<Vec<_>>();
            let records: Vec<PeerRecord> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert_eq!(registry.len(), 1);
            assert!(records.iter().all(|r| r.id == records[0].id));
            assert!(records.iter().all(|r| r.auth_token == records[0].auth_token));
        }
    }

    #[test]
    fn stale_peers_are_reported() {
        let registry = Registry::new();
        let p = registry.register(Role::Player, "localhost:9001", None).unwrap();
        assert!(registry.stale_peers(Duration::from_secs(60)).is_empty());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.stale_peers(Duration::from_millis(1)), vec![p.id.clone()]);
        registry.touch(&p.id);
        assert!(registry.stale_peers(Duration::from_secs(60)).is_empty());
    }
}
