mod common;

use std::sync::Arc;
use std::time::Duration;

use causal_raft::{KvCommand, KvStore, MemberId, StateMachine, StoreIdentity};
use common::test_cluster::TestCluster;
use common::{address, eventually, init_tracing, test_options};

fn populated_store(identity: StoreIdentity) -> Arc<KvStore> {
    let store = KvStore::with_identity(identity);
    store.apply(1, &KvCommand::put("local", "data").encode()).unwrap();
    Arc::new(store)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn startup_refuses_store_from_another_cluster() {
    init_tracing();
    let mut cluster = TestCluster::new(3);
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;
    let cluster_id = cluster.node(&leader).status().store_id.unwrap();

    let stranger = MemberId::new("stranger");
    let mut options = test_options(&stranger, &[], false);
    options.cluster_store_id = Some(cluster_id);
    let foreign = populated_store(StoreIdentity::new(7, 7));

    let result = cluster.start_with_store(options, foreign.clone());
    assert!(result.is_err());
    assert_eq!(foreign.get("local").as_deref(), Some("data"));
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_store_adopts_expected_identity_at_startup() {
    init_tracing();
    let mut cluster = TestCluster::new(3);
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;
    let cluster_id = cluster.node(&leader).status().store_id.unwrap();

    let newcomer = MemberId::new("newcomer");
    let mut options = test_options(&newcomer, &[], false);
    options.cluster_store_id = Some(cluster_id);
    let store = Arc::new(KvStore::new());
    cluster.start_with_store(options, store.clone()).unwrap();
    assert_eq!(store.identity(), Some(cluster_id));
    assert_eq!(cluster.node(&newcomer).status().store_id, Some(cluster_id));
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn member_with_foreign_data_stops_instead_of_joining() {
    init_tracing();
    let mut cluster = TestCluster::new(3);
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;
    cluster.put("shared", "1").await;

    let stranger = MemberId::new("stranger");
    let foreign = populated_store(StoreIdentity::new(7, 7));
    cluster
        .start_with_store(test_options(&stranger, &[], false), foreign.clone())
        .unwrap();
    cluster
        .node(&leader)
        .add_read_replica(stranger.clone(), address(&stranger))
        .await
        .unwrap();

    let stopped = eventually(Duration::from_secs(5), || {
        let done = cluster.node(&stranger).status().fatal.is_some();
        async move { done }
    })
    .await;
    assert!(stopped, "member with foreign data kept running");
    assert_eq!(foreign.get("shared"), None);
    assert_eq!(foreign.get("local").as_deref(), Some("data"));

    // the rest of the cluster is unaffected
    cluster.put("later", "2").await;
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blank_member_adopts_identity_from_leader() {
    init_tracing();
    let mut cluster = TestCluster::new(3);
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;
    let cluster_id = cluster.node(&leader).status().store_id.unwrap();
    cluster.put("shared", "1").await;

    let newcomer = MemberId::new("edge-1");
    cluster.start_spare(&newcomer, |_| {});
    assert_eq!(cluster.node(&newcomer).status().store_id, None);
    cluster
        .node(&leader)
        .add_read_replica(newcomer.clone(), address(&newcomer))
        .await
        .unwrap();

    let joined = eventually(Duration::from_secs(5), || {
        let status = cluster.node(&newcomer).status();
        let done = status.store_id == Some(cluster_id)
            && cluster.store(&newcomer).get("shared").is_some();
        async move { done }
    })
    .await;
    assert!(joined);
    assert!(cluster.node(&newcomer).status().fatal.is_none());
    cluster.shutdown().await;
}
