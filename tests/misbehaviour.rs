mod common;

use std::sync::Arc;
use std::time::Duration;

use agent_league::error::ProtocolError;
use agent_league::events;
use agent_league::match_record::{MatchState, TerminationReason};
use agent_league::protocol::Method;
use agent_league::registry::PeerStatus;
use agent_league::rpc_server::RpcHandler;
use agent_league::strategy::FixedStrategy;
use common::{fast_constraints, quiet, Mute, TestLeague};
use futures::future::BoxFuture;
use serde_json::{json, Value};

/// Upper bound for a league of one match against a player that never answers: every round
/// waits out the move timeout, plus invitations, result reports and scheduling slack.
fn one_match_bound(t: &TestLeague) -> Duration {
    let constraints = t.league.constraints();
    let rounds = t.league.config().total_rounds();
    constraints.move_timeout() * rounds
        + constraints.invitation_timeout()
        + constraints.rpc_timeout()
        + Duration::from_secs(1)
}

/// Answers every move request, always with an illegal move.
struct Cheater;

impl RpcHandler for Cheater {
    fn handle(&self, method: Method, _params: Value) -> BoxFuture<'_, Result<Value, ProtocolError>> {
        Box::pin(async move {
            match method {
                Method::InviteMatch => Ok(json!({ "accepted": true })),
                Method::RequestMove => Ok(json!({ "move": 99 })),
                _ => Ok(json!({ "ok": true })),
            }
        })
    }
}

#[tokio::test]
async fn silent_player_forfeits() {
    // high threshold: the player is never ejected, only unresponsive
    let t = TestLeague::new(quiet().with_ejection_threshold(10), fast_constraints());
    let (good, _) = t.agent("good:9000", Arc::new(FixedStrategy(1)));
    let mute = t.handler("mute:9000", Arc::new(Mute));

    let bound = one_match_bound(&t);
    let started = std::time::Instant::now();
    let standings = tokio::time::timeout(bound, t.league.run())
        .await
        .expect("league did not finish in time")
        .unwrap();
    assert!(started.elapsed() < bound);
    let snapshot = t.league.snapshot().await;
    let record = &snapshot.matches[0];
    assert_eq!(record.state, MatchState::Forfeited);
    assert_eq!(record.termination, Some(TerminationReason::Unresponsive));
    assert_eq!(record.winner.as_ref(), Some(&good.id));
    assert_eq!(record.rounds_played, 3);
    let mute_side_a = record.player_a_id == mute.id;
    assert!(record
        .history
        .iter()
        .all(|r| if mute_side_a { r.substituted_a } else { r.substituted_b }));

    assert_eq!(standings[0].peer_id, good.id);
    assert_eq!(standings[0].points, 3);
    assert_eq!(standings[1].losses, 1);

    let score = t.league.detector().score(&mute.id);
    assert_eq!(score.timeout_count, 3);
    assert!(!score.ejected);
    assert_eq!(
        t.league.registry().get(&mute.id).map(|p| p.status),
        Some(PeerStatus::Available)
    );
}

#[tokio::test]
async fn ejected_player_loses_the_rest_of_the_league() {
    let mut t = TestLeague::new(quiet(), fast_constraints());
    let (first, _) = t.agent("first:9000", Arc::new(FixedStrategy(1)));
    let (second, _) = t.agent("second:9000", Arc::new(FixedStrategy(2)));
    let mute = t.handler("mute:9000", Arc::new(Mute));

    let standings = t.league.run().await.unwrap();
    let snapshot = t.league.snapshot().await;
    let involving: Vec<_> = snapshot
        .matches
        .iter()
        .filter(|m| m.player_a_id == mute.id || m.player_b_id == mute.id)
        .collect();
    assert_eq!(involving.len(), 2);

    // ejected during its first match, after three silent rounds
    let ejection = involving
        .iter()
        .find(|m| m.termination == Some(TerminationReason::PeerEjected))
        .unwrap();
    assert_eq!(ejection.rounds_played, 3);
    assert_eq!(ejection.winner.as_ref(), Some(&second.id));

    // the second one is never played
    let walkover = involving
        .iter()
        .find(|m| m.termination == Some(TerminationReason::Walkover))
        .unwrap();
    assert_eq!(walkover.rounds_played, 0);
    assert_eq!(walkover.winner.as_ref(), Some(&first.id));

    let row = standings.iter().find(|e| e.peer_id == mute.id).unwrap();
    assert_eq!((row.points, row.losses), (0, 2));
    assert_eq!(
        t.league.registry().get(&mute.id).map(|p| p.status),
        Some(PeerStatus::Ejected)
    );
    assert!(t.league.detector().is_ejected(&mute.id));

    let ejections: Vec<_> = t
        .drain_events()
        .into_iter()
        .filter(|e| e.event_type == events::PEER_EJECTED)
        .collect();
    assert_eq!(ejections.len(), 1);
    assert_eq!(ejections[0].payload["peer_id"], json!(mute.id));
}

#[tokio::test]
async fn illegal_moves_are_replaced_then_punished() {
    let t = TestLeague::new(quiet(), fast_constraints());
    let (good, _) = t.agent("good:9000", Arc::new(FixedStrategy(3)));
    let cheater = t.handler("cheater:9000", Arc::new(Cheater));

    tokio::time::timeout(one_match_bound(&t), t.league.run())
        .await
        .expect("league did not finish in time")
        .unwrap();
    let snapshot = t.league.snapshot().await;
    assert_eq!(snapshot.matches.len(), 1);
    let record = &snapshot.matches[0];
    assert_eq!(record.state, MatchState::Forfeited);
    assert_eq!(record.termination, Some(TerminationReason::PeerEjected));
    assert_eq!(record.winner.as_ref(), Some(&good.id));
    // forfeited at the boundary of the round that reached the threshold
    assert_eq!(record.rounds_played, 3);
    assert_eq!(
        record.history.iter().map(|r| r.round_index).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    let cheater_side_a = record.player_a_id == cheater.id;
    for round in &record.history {
        let (played, substituted) = if cheater_side_a {
            (round.move_a, round.substituted_a)
        } else {
            (round.move_b, round.substituted_b)
        };
        assert_eq!(played, 1);
        assert!(substituted);
    }

    let score = t.league.detector().score(&cheater.id);
    assert_eq!(score.invalid_count, 3);
    assert_eq!(score.timeout_count, 0);
    assert!(score.ejected);
}
