mod common;

use std::path::Path;
use std::sync::Arc;

use agent_league::agent::{Credentials, PlayerAgent};
use agent_league::error::SchedulerError;
use agent_league::prelude::*;
use agent_league::registry::PeerRecord;
use agent_league::store::SnapshotStore;
use agent_league::strategy::FixedStrategy;
use common::{quiet, relaxed_constraints};

fn league_at(path: &Path, wire: Arc<LoopbackWire>) -> LeagueManager {
    LeagueManager::builder()
        .with_configuration(quiet())
        .with_constraints(relaxed_constraints())
        .with_wire(wire)
        .with_snapshot(path)
        .build()
        .unwrap()
}

/// Serve a fresh agent for an already registered peer.
fn serve(wire: &LoopbackWire, peer: &PeerRecord, value: Move) {
    let agent = Arc::new(PlayerAgent::new(peer.id.clone(), Arc::new(FixedStrategy(value))));
    agent.set_credentials(Credentials {
        peer_id: peer.id.clone(),
        auth_token: peer.auth_token.clone(),
    });
    wire.bind(peer.endpoint.clone(), agent);
}

#[tokio::test]
async fn interrupted_league_resumes_where_it_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("league.json");

    let wire = Arc::new(LoopbackWire::new());
    let first = league_at(&path, wire.clone());
    let peers: Vec<PeerRecord> = (0..3)
        .map(|i| {
            let peer = first
                .register(Role::Player, &format!("player{i}:9000"), None)
                .unwrap();
            serve(&wire, &peer, i + 1);
            peer
        })
        .collect();
    let schedule = first.start().await.unwrap();
    assert_eq!(schedule.len(), 3);
    first.run_round(1).await.unwrap();
    let played = first.snapshot().await;
    drop(first);

    let on_disk = SnapshotStore::new(&path).load().unwrap().unwrap();
    assert_eq!(on_disk.completed_rounds, vec![1]);
    assert_eq!(on_disk.matches, played.matches);

    // a new process: same endpoints, new agents
    let wire = Arc::new(LoopbackWire::new());
    let second = league_at(&path, wire.clone());
    assert_eq!(second.registry().len(), 3);
    assert_eq!(second.standings(), played.standings);
    for (i, peer) in peers.iter().enumerate() {
        let restored = second.registry().get(&peer.id).unwrap();
        assert_eq!(restored.auth_token, peer.auth_token);
        serve(&wire, &restored, i as Move + 1);
    }

    assert_eq!(
        second.run_round(1).await.unwrap_err(),
        SchedulerError::DuplicateRound(1)
    );
    assert_eq!(second.start().await.unwrap(), schedule);

    let standings = second.run().await.unwrap();
    assert!(standings.iter().all(|e| e.matches_played == 2));
    let done = second.snapshot().await;
    assert_eq!(done.completed_rounds, vec![1, 2, 3]);
    assert_eq!(done.matches.len(), 3);
    assert_eq!(done.matches[0], played.matches[0]);
}

#[tokio::test]
async fn restored_registry_keeps_ids_unique() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("league.json");

    let first = league_at(&path, Arc::new(LoopbackWire::new()));
    first.register(Role::Player, "a:9000", None).unwrap();
    first.register(Role::Player, "b:9000", None).unwrap();
    first.start().await.unwrap();
    drop(first);

    let second = league_at(&path, Arc::new(LoopbackWire::new()));
    let late = second.register(Role::Player, "c:9000", None).unwrap();
    assert_eq!(late.id, "P0003");
}
