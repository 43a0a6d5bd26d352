mod common;

use std::time::Duration;

use causal_raft::{ClientError, MemberId, MemberRole};
use common::test_cluster::TestCluster;
use common::{address, eventually, init_tracing};

async fn cluster_with_replica() -> (TestCluster, MemberId) {
    let mut cluster = TestCluster::new(3);
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;
    let replica = MemberId::new("edge-0");
    cluster.start_spare(&replica, |_| {});
    cluster
        .node(&leader)
        .add_read_replica(replica.clone(), address(&replica))
        .await
        .expect("adding read replica failed");
    (cluster, replica)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn read_replica_observes_committed_writes() {
    init_tracing();
    let (cluster, replica) = cluster_with_replica().await;
    let index = cluster.put("T1", "1").await;

    let applied = cluster
        .node(&replica)
        .await_applied_at_least(index, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(applied >= index);
    assert_eq!(cluster.store(&replica).get("T1").as_deref(), Some("1"));

    let leader = cluster.current_leader().unwrap();
    let overview = cluster.node(&leader).cluster_overview();
    let roles: Vec<_> = overview.iter().map(|m| (m.id.clone(), m.role)).collect();
    assert!(roles.contains(&(replica.clone(), MemberRole::ReadReplica)));
    assert!(roles.contains(&(leader.clone(), MemberRole::Leader)));
    assert_eq!(
        overview.iter().filter(|m| m.role == MemberRole::Follower).count(),
        2
    );
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn paused_replica_times_out_then_resolves() {
    init_tracing();
    let (mut cluster, replica) = cluster_with_replica().await;
    let first = cluster.put("T1", "1").await;
    cluster
        .node(&replica)
        .await_applied_at_least(first, Duration::from_secs(5))
        .await
        .unwrap();

    cluster.isolate(&replica);
    let second = cluster.put("T2", "2").await;

    let result = cluster
        .node(&replica)
        .await_applied_at_least(second, Duration::from_millis(300))
        .await;
    assert!(
        matches!(result, Err(ClientError::Timeout { target, .. }) if target == second),
        "{:?}",
        result
    );
    assert_eq!(cluster.store(&replica).get("T2"), None);

    let tracker = cluster.node(&replica).tracker().clone();
    let waiter =
        tokio::spawn(async move { tracker.await_applied_at_least(second, Duration::from_secs(5)).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());

    cluster.restore(&replica);
    let applied = waiter.await.unwrap().unwrap();
    assert!(applied >= second);
    assert_eq!(cluster.store(&replica).get("T2").as_deref(), Some("2"));
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replica_never_votes_or_leads() {
    init_tracing();
    let (mut cluster, replica) = cluster_with_replica().await;
    cluster.put("a", "1").await;
    let leader = cluster.current_leader().unwrap();

    cluster.kill(&leader).await;
    let successor = cluster.wait_for_leader(Duration::from_secs(5)).await;
    assert_ne!(successor, replica);

    let index = cluster.put("b", "2").await;
    let caught_up = eventually(Duration::from_secs(5), || {
        let done = cluster.node(&replica).status().applied_index >= index;
        async move { done }
    })
    .await;
    assert!(caught_up);
    assert!(cluster.node(&replica).status().membership.is_learner(&replica));
    cluster.shutdown().await;
}
