use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use causal_raft::{
    ClientError, KvCommand, KvStore, MemberId, MemoryNetwork, MemoryStorage, RaftNode,
    RaftOptions, Role,
};
use tracing::info;

use super::{eventually, member, test_options};

/// A member's durable parts, kept across restarts.
pub struct TestMember {
    pub node: Option<RaftNode>,
    pub storage: MemoryStorage,
    pub store: Arc<KvStore>,
    pub options: RaftOptions,
}

pub struct TestCluster {
    pub network: MemoryNetwork,
    members: BTreeMap<MemberId, TestMember>,
    isolated: HashSet<MemberId>,
}

impl TestCluster {
    /// Starts `size` voters; the first one bootstraps the store identity.
    pub fn new(size: usize) -> Self {
        Self::with_options(size, |_| {})
    }

    pub fn with_options(size: usize, tweak: impl Fn(&mut RaftOptions)) -> Self {
        let mut cluster = Self {
            network: MemoryNetwork::new(),
            members: BTreeMap::new(),
            isolated: HashSet::new(),
        };
        let initial: Vec<MemberId> = (0..size).map(member).collect();
        for (i, id) in initial.iter().enumerate() {
            let mut options = test_options(id, &initial, i == 0);
            tweak(&mut options);
            cluster.launch(options, MemoryStorage::new(), Arc::new(KvStore::new()));
        }
        info!("Test cluster started with {} members", size);
        cluster
    }

    fn launch(&mut self, options: RaftOptions, storage: MemoryStorage, store: Arc<KvStore>) {
        let id = options.id.clone();
        let node = RaftNode::start(
            options.clone(),
            Box::new(storage.clone()),
            store.clone(),
            Arc::new(self.network.clone()),
        )
        .expect("member failed to start");
        self.network.register(node.inbox());
        self.members.insert(
            id,
            TestMember {
                node: Some(node),
                storage,
                store,
                options,
            },
        );
    }

    /// Starts a member outside the initial membership; it waits to be added.
    pub fn start_spare(&mut self, id: &MemberId, tweak: impl Fn(&mut RaftOptions)) {
        let mut options = test_options(id, &[], false);
        tweak(&mut options);
        self.launch(options, MemoryStorage::new(), Arc::new(KvStore::new()));
    }

    /// Starts a member over a pre-populated store.
    pub fn start_with_store(&mut self, options: RaftOptions, store: Arc<KvStore>) -> Result<(), String> {
        let node = RaftNode::start(
            options.clone(),
            Box::new(MemoryStorage::new()),
            store.clone(),
            Arc::new(self.network.clone()),
        )
        .map_err(|e| e.to_string())?;
        self.network.register(node.inbox());
        self.members.insert(
            options.id.clone(),
            TestMember {
                node: Some(node),
                storage: MemoryStorage::new(),
                store,
                options,
            },
        );
        Ok(())
    }

    pub fn ids(&self) -> Vec<MemberId> {
        self.members.keys().cloned().collect()
    }

    pub fn running(&self) -> Vec<MemberId> {
        self.members
            .iter()
            .filter(|(_, m)| m.node.is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn node(&self, id: &MemberId) -> &RaftNode {
        self.members[id].node.as_ref().expect("member is not running")
    }

    pub fn store(&self, id: &MemberId) -> Arc<KvStore> {
        self.members[id].store.clone()
    }

    pub fn storage(&self, id: &MemberId) -> MemoryStorage {
        self.members[id].storage.clone()
    }

    pub async fn kill(&mut self, id: &MemberId) {
        if let Some(node) = self.members.get_mut(id).and_then(|m| m.node.take()) {
            node.shutdown().await;
        }
        self.network.unregister(id);
        info!("Killed {}", id);
    }

    /// Restarts a killed member over the storage and store it left behind.
    pub fn restart(&mut self, id: &MemberId) {
        let member = self.members.remove(id).expect("unknown member");
        assert!(member.node.is_none(), "member is still running");
        self.launch(member.options, member.storage, member.store);
        info!("Restarted {}", id);
    }

    pub fn isolate(&mut self, id: &MemberId) {
        self.network.isolate(id);
        self.isolated.insert(id.clone());
    }

    pub fn restore(&mut self, id: &MemberId) {
        self.network.restore(id);
        self.isolated.remove(id);
    }

    /// The leader of the highest term among reachable running members.
    pub fn current_leader(&self) -> Option<MemberId> {
        self.running()
            .into_iter()
            .filter(|id| !self.isolated.contains(id))
            .map(|id| self.node(&id).status())
            .filter(|s| s.role == Role::Leader)
            .max_by_key(|s| s.term)
            .map(|s| s.id)
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> MemberId {
        let mut found = None;
        eventually(timeout, || {
            found = self.current_leader();
            let done = found.is_some();
            async move { done }
        })
        .await;
        found.expect("no leader elected")
    }

    /// Submits through whoever leads, retrying across leader changes.
    pub async fn submit(&self, command: Vec<u8>) -> Result<u64, ClientError> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let result = match self.current_leader() {
                Some(leader) => self.node(&leader).submit(command.clone()).await,
                None => Err(ClientError::NotLeader(None)),
            };
            match result {
                Ok(index) => return Ok(index),
                Err(
                    ClientError::NotLeader(_)
                    | ClientError::LeadershipLost
                    | ClientError::RequestTimeout
                    | ClientError::Shutdown,
                ) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn put(&self, key: &str, value: &str) -> u64 {
        self.submit(KvCommand::put(key, value).encode())
            .await
            .expect("put failed")
    }

    /// Waits until every given member holds the same data at the same
    /// applied index.
    pub async fn data_matches_eventually(&self, ids: &[MemberId], timeout: Duration) -> bool {
        eventually(timeout, || {
            let stores: Vec<_> = ids.iter().map(|id| self.store(id)).collect();
            let applied: Vec<_> = ids
                .iter()
                .map(|id| self.node(id).status().applied_index)
                .collect();
            let first = stores[0].data();
            let done = stores.iter().all(|s| s.data() == first)
                && applied.iter().all(|a| *a == applied[0]);
            async move { done }
        })
        .await
    }

    pub async fn shutdown(mut self) {
        for id in self.ids() {
            self.kill(&id).await;
        }
    }
}
