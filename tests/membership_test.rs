mod common;

use std::time::Duration;

use causal_raft::{ClientError, MemberId, Role};
use common::test_cluster::TestCluster;
use common::{address, eventually, init_tracing, member};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn adds_a_voter_through_joint_consensus() {
    init_tracing();
    let mut cluster = TestCluster::new(3);
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;
    cluster.put("before", "1").await;

    let newcomer = member(3);
    cluster.start_spare(&newcomer, |_| {});
    cluster
        .node(&leader)
        .add_member(newcomer.clone(), address(&newcomer))
        .await
        .unwrap();

    let status = cluster.node(&leader).status();
    assert!(!status.membership.is_joint());
    assert_eq!(status.membership.voters.len(), 4);
    assert!(status.membership.is_voter(&newcomer));

    cluster.put("after", "2").await;
    let all = cluster.ids();
    assert!(cluster.data_matches_eventually(&all, Duration::from_secs(5)).await);
    assert_eq!(cluster.store(&newcomer).history(), vec!["before", "after"]);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn removed_voter_no_longer_counts_toward_quorum() {
    init_tracing();
    let mut cluster = TestCluster::new(3);
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;
    let removed = cluster
        .ids()
        .into_iter()
        .find(|id| *id != leader)
        .unwrap();

    cluster.node(&leader).remove_member(removed.clone()).await.unwrap();
    let status = cluster.node(&leader).status();
    assert_eq!(status.membership.voters.len(), 2);
    assert!(!status.membership.contains(&removed));

    // two remaining voters still form a majority of the new set
    cluster.kill(&removed).await;
    cluster.put("k", "v").await;
    let remaining = cluster.running();
    assert!(cluster.data_matches_eventually(&remaining, Duration::from_secs(5)).await);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_removing_itself_hands_over() {
    init_tracing();
    let cluster = TestCluster::new(3);
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;
    cluster.put("a", "1").await;

    cluster.node(&leader).remove_member(leader.clone()).await.unwrap();
    let stepped_down = eventually(Duration::from_secs(3), || {
        let done = cluster.node(&leader).current_role() != Role::Leader;
        async move { done }
    })
    .await;
    assert!(stepped_down);

    let successor = cluster.wait_for_leader(Duration::from_secs(5)).await;
    assert_ne!(successor, leader);
    assert!(!cluster.node(&successor).status().membership.contains(&leader));
    cluster.put("b", "2").await;
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_changes_are_serialized() {
    init_tracing();
    let mut cluster = TestCluster::new(3);
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;
    let first = member(3);
    let second = member(4);
    cluster.start_spare(&first, |_| {});
    cluster.start_spare(&second, |_| {});

    let node = cluster.node(&leader);
    let (a, b) = tokio::join!(
        node.add_member(first.clone(), address(&first)),
        node.add_member(second.clone(), address(&second)),
    );
    assert!(a.is_ok(), "{:?}", a);
    assert_eq!(b, Err(ClientError::ConfigChangeInProgress));

    // once the first change is done the second one goes through
    node.add_member(second.clone(), address(&second)).await.unwrap();
    assert_eq!(node.status().membership.voters.len(), 5);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn followers_refuse_membership_changes() {
    init_tracing();
    let cluster = TestCluster::new(3);
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;
    cluster.put("a", "1").await;
    let follower = cluster
        .ids()
        .into_iter()
        .find(|id| *id != leader)
        .unwrap();

    let result = cluster
        .node(&follower)
        .add_read_replica(MemberId::new("edge-9"), "mem://edge-9".to_string())
        .await;
    assert_eq!(result, Err(ClientError::NotLeader(Some(leader))));
    cluster.shutdown().await;
}
