//! Integration tests for action replication over real UDP sockets.

mod common;

use std::time::Duration;

use anyhow::Result;
use common::{TIMEOUT, TestCluster, bind, wait_for};
use game_raft::MembershipState;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_node_applies_the_same_history() -> Result<()> {
    let cluster = TestCluster::start(&["alice", "bob", "carol"]).await?;

    cluster.node(0).submit_action("deal").await;
    cluster.node(1).submit_action("bet 5").await;
    cluster.node(2).submit_action("fold").await;
    cluster.node(1).submit_action("call").await;

    cluster.wait_for_commands(4, TIMEOUT).await?;

    let reference = cluster.history(0).snapshot();
    for i in 1..3 {
        assert_eq!(cluster.history(i).snapshot(), reference, "node {i} diverged");
    }
    for (position, entry) in reference.iter().enumerate() {
        assert_eq!(entry.index, position as u64);
    }

    let mut commands = cluster.history(0).commands();
    commands.sort();
    assert_eq!(commands, vec!["bet 5", "call", "deal", "fold"]);

    for member in &cluster.members {
        let status = member.node.status();
        assert!(status.commit_index < status.log_len as i64);
        assert_eq!(status.leader.as_deref(), Some("alice"));
    }

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_joiner_catches_up() -> Result<()> {
    let mut cluster = TestCluster::start(&["alice", "bob"]).await?;

    // More than one catch-up batch.
    for turn in 0..40 {
        cluster.node(0).submit_action(format!("turn {turn}")).await;
    }
    cluster.wait_for_commands(40, TIMEOUT).await?;

    let dave = cluster.join("dave").await?;
    cluster.wait_for_membership(TIMEOUT).await?;
    wait_for("dave to match alice", TIMEOUT, || {
        let reference = cluster.history(0).snapshot();
        reference.len() == 43 && cluster.history(dave).snapshot() == reference
    })
    .await?;

    assert_eq!(cluster.history(dave).commands()[0], "turn 0");

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_commits_alone_once_followers_time_out() -> Result<()> {
    let cluster = TestCluster::start(&["alice", "bob", "carol"]).await?;
    let leader = cluster.node(0);

    cluster.node(1).exit_group().await;
    cluster.node(2).exit_group().await;

    wait_for("followers to time out", TIMEOUT, || {
        ["bob", "carol"]
            .iter()
            .all(|name| leader.sessions().get(name).is_some_and(|s| s.is_timed_out()))
    })
    .await?;

    let target = leader.log().last_index() + 1;
    leader.submit_action("solo move").await;
    let committed = tokio::time::timeout(TIMEOUT, leader.wait_committed(target)).await?;
    assert!(committed);
    assert_eq!(leader.state(), MembershipState::Leader);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silenced_follower_returns_without_an_election() -> Result<()> {
    let cluster = TestCluster::start(&["alice", "bob", "carol"]).await?;
    let leader = cluster.node(0);
    let term = leader.term();

    // The leader stops broadcasting to bob until bob speaks up.
    leader
        .sessions()
        .get("bob")
        .expect("bob is a member")
        .mark_timed_out();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(leader.state(), MembershipState::Leader);
    assert_eq!(leader.term(), term);
    assert_eq!(cluster.node(1).term(), term);
    assert_eq!(cluster.node(1).leader().as_deref(), Some("alice"));
    assert!(leader.sessions().get("bob").is_some_and(|s| !s.is_timed_out()));

    cluster.node(1).submit_action("still here").await;
    cluster.wait_for_commands(1, TIMEOUT).await?;

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversized_action_does_not_stall_replication() -> Result<()> {
    let cluster = TestCluster::start(&["alice", "bob", "carol"]).await?;

    cluster.node(0).submit_action("x".repeat(70_000)).await;
    cluster.node(0).submit_action("after").await;
    cluster.wait_for_commands(1, TIMEOUT).await?;

    for member in cluster.active() {
        assert_eq!(member.history.commands(), vec!["after".to_string()]);
    }

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_names_are_not_admitted() -> Result<()> {
    let cluster = TestCluster::start(&["alice", "bob"]).await?;

    let impostor = bind("bob").await?;
    impostor.node.join_group(cluster.node(0).local_addr()).await?;
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert_eq!(impostor.node.leader(), None);
    assert!(impostor.history.is_empty());
    assert_eq!(
        cluster.node(0).sessions().get("bob").map(|s| s.address()),
        Some(cluster.node(1).local_addr())
    );

    impostor.node.exit_group().await;
    cluster.shutdown().await;
    Ok(())
}
