mod common;

use std::collections::HashSet;
use std::time::Duration;

use agent_league::error::SchedulerError;
use agent_league::events;
use agent_league::match_record::{MatchState, TerminationReason};
use agent_league::tournament_strategy::{RoundRobinTournament, TournamentStrategy};
use common::{fast_constraints, quiet, relaxed_constraints, TestLeague};

#[tokio::test]
async fn four_players_play_everyone_once() {
    let mut t = TestLeague::new(quiet(), relaxed_constraints());
    let agents = t.random_agents(4);

    assert_eq!(t.league.await_players(4).await, 4);
    let standings = t.league.run().await.unwrap();
    assert_eq!(standings.len(), 4);
    assert!(standings.iter().all(|e| e.matches_played == 3));
    assert!(standings.windows(2).all(|w| w[0].points >= w[1].points));

    let snapshot = t.league.snapshot().await;
    assert_eq!(snapshot.matches.len(), 6);
    assert_eq!(snapshot.completed_rounds, vec![1, 2, 3]);
    assert!(snapshot
        .matches
        .iter()
        .all(|m| m.state == MatchState::Completed && m.rounds_played >= 3));

    for (_, agent) in &agents {
        assert_eq!(agent.matches_joined(), 3);
        assert_eq!(agent.results().len(), 3);
    }

    let emitted = t.drain_events();
    let count = |kind: &str| emitted.iter().filter(|e| e.event_type == kind).count();
    assert_eq!(count(events::PEER_REGISTERED), 4);
    assert_eq!(count(events::MATCH_STARTED), 6);
    assert_eq!(count(events::MATCH_COMPLETED), 6);
    assert_eq!(count(events::STANDINGS_UPDATED), 6);
    assert_eq!(count(events::PEER_EJECTED), 0);
}

#[tokio::test]
async fn points_are_conserved() {
    let t = TestLeague::new(quiet(), relaxed_constraints());
    t.random_agents(6);

    let standings = t.league.run().await.unwrap();
    let snapshot = t.league.snapshot().await;
    let tally = snapshot.tally;
    assert_eq!(tally.total(), 15);

    let points: u32 = standings.iter().map(|e| e.points).sum();
    let wins: u32 = standings.iter().map(|e| e.wins).sum();
    let draws: u32 = standings.iter().map(|e| e.draws).sum();
    let played: u32 = standings.iter().map(|e| e.matches_played).sum();
    assert_eq!(points, 3 * tally.decisive + 2 * tally.drawn);
    assert_eq!(wins, tally.decisive);
    assert_eq!(draws, 2 * tally.drawn);
    assert_eq!(played, 2 * tally.total());
}

#[tokio::test]
async fn every_pair_meets_exactly_once() {
    let t = TestLeague::new(quiet(), relaxed_constraints());
    t.random_agents(5);
    t.league.run().await.unwrap();

    let snapshot = t.league.snapshot().await;
    let mut pairs = HashSet::new();
    for m in &snapshot.matches {
        let mut pair = [m.player_a_id.clone(), m.player_b_id.clone()];
        pair.sort();
        assert!(pairs.insert(pair), "{m} played twice");
    }
    assert_eq!(pairs.len(), 10);

    // one bye per round, nobody twice
    let byes: HashSet<_> = snapshot.schedule.iter().filter_map(|r| r.bye.clone()).collect();
    assert_eq!(byes.len(), 5);
}

#[test]
fn schedule_alternates_sides() {
    let players: Vec<String> = (1..=6).map(|i| format!("P{i:04}")).collect();
    let rounds = RoundRobinTournament::new(true).schedule(&players);
    assert_eq!(rounds.len(), 5);
    for player in &players {
        let as_a = rounds
            .iter()
            .flat_map(|r| &r.pairings)
            .filter(|p| &p.player_a == player)
            .count();
        // five matches, never always on the same side
        assert!((1..=4).contains(&as_a), "{player} is side A {as_a} times");
    }
}

#[tokio::test]
async fn rounds_are_not_replayed() {
    let t = TestLeague::new(quiet(), relaxed_constraints());
    t.random_agents(2);

    assert_eq!(t.league.run_round(1).await.unwrap_err(), SchedulerError::NoSchedule);
    t.league.run().await.unwrap();
    assert_eq!(
        t.league.run_round(1).await.unwrap_err(),
        SchedulerError::DuplicateRound(1)
    );
    assert_eq!(t.league.snapshot().await.matches.len(), 1);
}

#[tokio::test]
async fn silent_league_terminates() {
    let t = TestLeague::new(quiet(), fast_constraints());
    for i in 0..3 {
        t.handler(&format!("hole{i}:9000"), std::sync::Arc::new(common::BlackHole));
    }

    let standings = tokio::time::timeout(Duration::from_secs(10), t.league.run())
        .await
        .expect("league hung")
        .unwrap();
    assert!(standings.iter().all(|e| e.points == 0 && e.losses == 2));

    let snapshot = t.league.snapshot().await;
    assert_eq!(snapshot.tally.no_contest, 3);
    assert!(snapshot.matches.iter().all(|m| {
        m.state == MatchState::Forfeited
            && m.winner.is_none()
            && m.termination == Some(TerminationReason::InvitationDeclined)
    }));
}
