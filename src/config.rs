use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::applier::ApplierOptions;
use crate::error::RaftError;
use crate::identity::StoreIdentity;
use crate::membership::MembershipSet;
use crate::types::MemberId;

#[derive(Debug, Clone)]
pub struct RaftOptions {
    pub id: MemberId,
    /// Voters of a brand new cluster, with their addresses. Every initial
    /// member must be given the same set; members that join later leave it
    /// empty and learn the membership from the leader.
    pub initial_members: Vec<(MemberId, String)>,
    /// Generate the store identity when the local store has none. Exactly one
    /// member of a new cluster should bootstrap.
    pub bootstrap: bool,
    /// When set, the local store must carry this identity or start fails.
    pub cluster_store_id: Option<StoreIdentity>,

    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub tick_interval: Duration,
    pub pre_vote: bool,

    pub max_append_entries: usize,
    pub snapshot_chunk_size: usize,
    pub snapshot_retry_interval: Duration,
    /// Applied entries since the last snapshot that trigger a new one.
    /// Zero disables automatic snapshots.
    pub snapshot_threshold: u64,
    /// Entries kept in the log below a new snapshot.
    pub log_retention: u64,

    pub client_timeout: Duration,
    pub applier: ApplierOptions,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            id: MemberId::new(""),
            initial_members: Vec::new(),
            bootstrap: false,
            cluster_store_id: None,
            election_timeout_min: Duration::from_millis(500),
            election_timeout_max: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_millis(50),
            tick_interval: Duration::from_millis(10),
            pre_vote: true,
            max_append_entries: 256,
            snapshot_chunk_size: 256 * 1024,
            snapshot_retry_interval: Duration::from_millis(200),
            snapshot_threshold: 10_000,
            log_retention: 1_000,
            client_timeout: Duration::from_secs(10),
            applier: ApplierOptions::default(),
        }
    }
}

impl RaftOptions {
    pub fn new(id: impl Into<MemberId>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn initial_membership(&self) -> MembershipSet {
        MembershipSet::new(self.initial_members.iter().cloned())
    }

    pub fn validate(&self) -> Result<(), RaftError> {
        let fail = |msg: &str| Err(RaftError::InvalidOptions(msg.to_string()));
        if self.id.as_str().is_empty() {
            return fail("member id must not be empty");
        }
        if self.election_timeout_min.is_zero()
            || self.election_timeout_max < self.election_timeout_min
        {
            return fail("election timeout range is invalid");
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return fail("heartbeat interval must be shorter than the election timeout");
        }
        if self.tick_interval.is_zero() {
            return fail("tick interval must be positive");
        }
        if self.max_append_entries == 0 || self.snapshot_chunk_size == 0 {
            return fail("batch sizes must be positive");
        }
        if self.bootstrap && !self.initial_members.iter().any(|(id, _)| *id == self.id) {
            return fail("a bootstrapping member must be one of the initial members");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub address: String,
}

/// On-disk configuration of the `causal-raft` binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub member_id: String,
    pub listen_addr: String,
    pub data_dir: PathBuf,
    pub bootstrap: bool,
    pub initial_members: Vec<PeerConfig>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub snapshot_threshold: u64,
    pub log_retention: u64,
    pub max_segment_size: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let defaults = RaftOptions::default();
        Self {
            member_id: String::new(),
            listen_addr: "127.0.0.1:7000".to_string(),
            data_dir: PathBuf::from("./data"),
            bootstrap: false,
            initial_members: Vec::new(),
            election_timeout_min_ms: defaults.election_timeout_min.as_millis() as u64,
            election_timeout_max_ms: defaults.election_timeout_max.as_millis() as u64,
            heartbeat_interval_ms: defaults.heartbeat_interval.as_millis() as u64,
            snapshot_threshold: defaults.snapshot_threshold,
            log_retention: defaults.log_retention,
            max_segment_size: 16 * 1024 * 1024,
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn raft_options(&self) -> RaftOptions {
        RaftOptions {
            id: MemberId::new(self.member_id.clone()),
            initial_members: self
                .initial_members
                .iter()
                .map(|p| (MemberId::new(p.id.clone()), p.address.clone()))
                .collect(),
            bootstrap: self.bootstrap,
            election_timeout_min: Duration::from_millis(self.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(self.election_timeout_max_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            snapshot_threshold: self.snapshot_threshold,
            log_retention: self.log_retention,
            ..Default::default()
        }
    }
}
