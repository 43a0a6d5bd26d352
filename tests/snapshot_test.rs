mod common;

use std::time::Duration;

use common::test_cluster::TestCluster;
use common::{eventually, init_tracing};

fn aggressive_pruning(options: &mut causal_raft::RaftOptions) {
    options.snapshot_threshold = 10;
    options.log_retention = 1;
    options.snapshot_chunk_size = 256;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn member_rejoining_after_pruning_installs_snapshot() {
    init_tracing();
    let mut cluster = TestCluster::with_options(3, aggressive_pruning);
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;
    let straggler = cluster
        .ids()
        .into_iter()
        .find(|id| *id != leader)
        .unwrap();
    cluster.kill(&straggler).await;

    for i in 0..100 {
        cluster.put(&format!("key-{}", i), &format!("value-{}", i)).await;
    }
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;
    let pruned = eventually(Duration::from_secs(3), || {
        let status = cluster.node(&leader).status();
        let done = status.snapshot_index >= 90 && status.first_log_index >= 90;
        async move { done }
    })
    .await;
    assert!(pruned, "{:?}", cluster.node(&leader).status());

    cluster.restart(&straggler);
    let all = cluster.ids();
    assert!(cluster.data_matches_eventually(&all, Duration::from_secs(10)).await);
    let rejoined = cluster.node(&straggler).status();
    assert!(rejoined.snapshots_installed >= 1);
    assert_eq!(cluster.store(&straggler).get("key-99").as_deref(), Some("value-99"));
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn isolated_follower_catches_up_by_snapshot() {
    init_tracing();
    let mut cluster = TestCluster::with_options(3, aggressive_pruning);
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;
    cluster.put("early", "1").await;
    let follower = cluster
        .ids()
        .into_iter()
        .find(|id| *id != leader)
        .unwrap();
    let all = cluster.ids();
    assert!(cluster.data_matches_eventually(&all, Duration::from_secs(5)).await);

    cluster.isolate(&follower);
    for i in 0..50 {
        cluster.put(&format!("k{}", i), "v").await;
    }
    cluster.restore(&follower);

    assert!(cluster.data_matches_eventually(&all, Duration::from_secs(10)).await);
    assert!(cluster.node(&follower).status().snapshots_installed >= 1);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn manual_snapshot_compacts_the_log() {
    init_tracing();
    let cluster = TestCluster::with_options(3, |options| {
        options.snapshot_threshold = 0;
        options.log_retention = 2;
    });
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;
    let mut last = 0;
    for i in 0..20 {
        last = cluster.put(&format!("k{}", i), "v").await;
    }
    assert_eq!(cluster.node(&leader).status().snapshot_index, 0);

    cluster.node(&leader).trigger_snapshot().unwrap();
    let taken = eventually(Duration::from_secs(3), || {
        let status = cluster.node(&leader).status();
        let done = status.snapshot_index >= last && status.first_log_index > last - 2;
        async move { done }
    })
    .await;
    assert!(taken, "{:?}", cluster.node(&leader).status());

    // the cluster keeps working on top of the compacted log
    cluster.put("after", "1").await;
    let all = cluster.ids();
    assert!(cluster.data_matches_eventually(&all, Duration::from_secs(5)).await);
    cluster.shutdown().await;
}
