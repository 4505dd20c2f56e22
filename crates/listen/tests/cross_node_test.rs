//! Integration tests for provider discovery across cluster nodes

mod common;
use common::test_cluster::{MATCH_COOLDOWN, TestCluster, settle};

use std::time::Duration;

use async_trait::async_trait;
use herald_core::Action;
use herald_locks::{LockManager, LockStatus};
use herald_locks_memory::MemoryLockManager;
use pretty_assertions::assert_eq;

/// A shared memory lock table that takes a while to confirm releases.
#[derive(Clone)]
struct SlowRelease(MemoryLockManager);

#[async_trait]
impl LockManager for SlowRelease {
    type Error = herald_locks_memory::Error;

    async fn check(&self, resource_id: String) -> Result<LockStatus, Self::Error> {
        self.0.check(resource_id).await
    }

    async fn try_lock(&self, resource_id: String) -> Result<bool, Self::Error> {
        self.0.try_lock(resource_id).await
    }

    async fn release(&self, resource_id: String) -> Result<(), Self::Error> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.0.release(resource_id).await
    }
}

/// Lets replicated state and lock traffic cross the in-memory network.
async fn propagate() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test(start_paused = true)]
async fn test_remote_provider_serves_subscriber() {
    let cluster = TestCluster::with_cluster_locks(2);
    cluster.when_ready().await;

    let provider = cluster.node(1).listen("a/.*");
    propagate().await;
    let subscriber = cluster.node(0).subscribe("a/1");
    propagate().await;

    assert!(provider.received(Action::SubscriptionForPatternFound, "a/1"));

    cluster.node(1).accept(&provider, "a/.*", "a/1");
    propagate().await;

    assert!(cluster.node(0).listener.has_active_provider("a/1"));
    assert!(cluster.node(1).listener.has_active_provider("a/1"));
    assert_eq!(subscriber.count_for(Action::SubscriptionHasProvider, "a/1"), 1);

    cluster.node(0).unsubscribe(&subscriber, "a/1");
    propagate().await;

    assert_eq!(
        provider.count_for(Action::SubscriptionForPatternRemoved, "a/1"),
        1
    );
    assert!(!cluster.node(0).listener.has_active_provider("a/1"));
}

#[tokio::test(start_paused = true)]
async fn test_only_one_node_runs_discovery() {
    let cluster = TestCluster::with_cluster_locks(2);
    cluster.when_ready().await;

    let providers = [cluster.node(0).listen("a/.*"), cluster.node(1).listen("a/.*")];
    propagate().await;
    cluster.node(0).subscribe("a/1");
    propagate().await;

    let offered: Vec<usize> = (0..providers.len())
        .filter(|&index| providers[index].received(Action::SubscriptionForPatternFound, "a/1"))
        .collect();
    assert_eq!(offered.len(), 1);

    let winner = offered[0];
    cluster
        .node(winner)
        .accept(&providers[winner], "a/.*", "a/1");
    propagate().await;

    for node in &cluster.nodes {
        assert!(node.listener.has_active_provider("a/1"));
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    let loser = 1 - winner;
    assert_eq!(providers[loser].count(Action::SubscriptionForPatternFound), 0);
}

#[tokio::test(start_paused = true)]
async fn test_remote_failure_respects_cooldown() {
    let cluster = TestCluster::new(2);
    cluster.when_ready().await;
    let (n0, n1) = (cluster.node(0), cluster.node(1));

    let local = n0.listen("a/.*");
    settle().await;
    n0.subscribe("a/1");
    propagate().await;
    n0.reject(&local, "a/.*", "a/1");
    propagate().await;
    assert_eq!(cluster.unsuccessful_broadcasts(0, "a/1"), 1);

    // A provider joining n1 gets its chance, but n0 failed too recently to
    // try again when n1 gives up.
    let remote = n1.listen("a/.*");
    propagate().await;
    assert!(remote.received(Action::SubscriptionForPatternFound, "a/1"));
    n1.reject(&remote, "a/.*", "a/1");
    propagate().await;

    assert_eq!(cluster.unsuccessful_broadcasts(1, "a/1"), 1);
    assert_eq!(local.count_for(Action::SubscriptionForPatternFound, "a/1"), 1);

    tokio::time::sleep(MATCH_COOLDOWN).await;

    n1.unlisten(&remote, "a/.*");
    propagate().await;
    n1.listen_with(&remote, "a/.*");
    propagate().await;
    assert_eq!(remote.count_for(Action::SubscriptionForPatternFound, "a/1"), 2);
    n1.reject(&remote, "a/.*", "a/1");
    propagate().await;

    assert_eq!(cluster.unsuccessful_broadcasts(1, "a/1"), 2);
    assert_eq!(local.count_for(Action::SubscriptionForPatternFound, "a/1"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_departed_provider_node_triggers_rediscovery() {
    let cluster = TestCluster::new(2);
    cluster.when_ready().await;
    let (n0, n1) = (cluster.node(0), cluster.node(1));

    let remote = n1.listen("a/.*");
    propagate().await;
    let subscriber = n0.subscribe("a/1");
    propagate().await;
    n1.accept(&remote, "a/.*", "a/1");
    propagate().await;
    assert!(n0.listener.has_active_provider("a/1"));

    let local = n0.listen("a/.*");
    propagate().await;
    assert_eq!(local.count(Action::SubscriptionForPatternFound), 0);

    n1.node.leave();
    propagate().await;

    assert!(!n0.listener.has_active_provider("a/1"));
    assert_eq!(
        subscriber.count_for(Action::SubscriptionHasNoProvider, "a/1"),
        1
    );
    assert!(local.received(Action::SubscriptionForPatternFound, "a/1"));
}

#[tokio::test(start_paused = true)]
async fn test_peer_runs_round_once_lock_is_released() {
    let cluster = TestCluster::with_lock_manager(2, SlowRelease(MemoryLockManager::new()));
    cluster.when_ready().await;

    let providers = [cluster.node(0).listen("a/.*"), cluster.node(1).listen("a/.*")];
    propagate().await;
    cluster.node(0).subscribe("a/1");
    propagate().await;

    let offered: Vec<usize> = (0..providers.len())
        .filter(|&index| providers[index].received(Action::SubscriptionForPatternFound, "a/1"))
        .collect();
    assert_eq!(offered.len(), 1);

    let (first, second) = (offered[0], 1 - offered[0]);
    cluster
        .node(first)
        .reject(&providers[first], "a/.*", "a/1");
    propagate().await;

    assert_eq!(cluster.unsuccessful_broadcasts(first, "a/1"), 1);
    assert!(providers[second].received(Action::SubscriptionForPatternFound, "a/1"));
}
