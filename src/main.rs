//! causal-raft - a replicated key/value member driven from stdin.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use causal_raft::config::PeerConfig;
use causal_raft::network::{TcpNetworkOptions, serve};
use causal_raft::{
    FileStorage, FileStorageOptions, KvCommand, KvStore, MemberId, NodeConfig, RaftNode,
    StoreIdentity, TcpNetwork,
};

#[derive(Parser, Debug)]
#[command(name = "causal-raft")]
#[command(about = "Raft replicated key/value member")]
struct Args {
    /// JSON configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Member id
    #[arg(long)]
    id: Option<String>,

    /// Address to listen on for peer traffic
    #[arg(long)]
    listen: Option<String>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Generate the store identity of a new cluster
    #[arg(long)]
    bootstrap: bool,

    /// Initial voter as `id=address`, repeatable
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Default filter when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn node_config(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => NodeConfig::default(),
        };
        if let Some(id) = &self.id {
            config.member_id = id.clone();
        }
        if let Some(listen) = &self.listen {
            config.listen_addr = listen.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        config.bootstrap |= self.bootstrap;
        for peer in &self.peers {
            let Some((id, address)) = peer.split_once('=') else {
                bail!("peer {:?} is not of the form id=address", peer);
            };
            config.initial_members.push(PeerConfig {
                id: id.to_string(),
                address: address.to_string(),
            });
        }
        Ok(config)
    }
}

fn load_identity(path: &Path) -> Result<Option<StoreIdentity>> {
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&std::fs::read(path)?)?))
}

/// Persists the store identity once the member learns it, so a restarted
/// member can stand for election before hearing from a leader.
fn remember_identity(node: &RaftNode, path: PathBuf) {
    let mut changes = node.status_changes();
    tokio::spawn(async move {
        loop {
            let store_id = changes.borrow_and_update().store_id;
            if let Some(identity) = store_id {
                match serde_json::to_vec(&identity) {
                    Ok(bytes) => {
                        if let Err(e) = std::fs::write(&path, bytes) {
                            warn!("Failed to persist store identity: {}", e);
                        }
                    }
                    Err(e) => warn!("Failed to encode store identity: {}", e),
                }
                return;
            }
            if changes.changed().await.is_err() {
                return;
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = args.node_config()?;
    let options = config.raft_options();
    options.validate()?;
    info!(
        "Starting member {} on {} with data in {:?}",
        config.member_id, config.listen_addr, config.data_dir
    );

    let mut storage_options = FileStorageOptions::new(&config.data_dir);
    storage_options.max_segment_size = config.max_segment_size;
    let storage = FileStorage::open(storage_options)?;

    let identity_path = config.data_dir.join("store_id.json");
    let store = Arc::new(match load_identity(&identity_path)? {
        Some(identity) => KvStore::with_identity(identity),
        None => KvStore::new(),
    });

    let network = Arc::new(TcpNetwork::new(TcpNetworkOptions::default()));
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let node = RaftNode::start(options, Box::new(storage), store.clone(), network)?;
    let _server = serve(listener, node.inbox());
    remember_identity(&node, identity_path);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let words: Vec<&str> = line.split_whitespace().collect();
        let outcome = match words.as_slice() {
            [] => continue,
            ["put", key, value] => node
                .submit(KvCommand::put(*key, *value).encode())
                .await
                .map(|index| format!("applied at {}", index)),
            ["delete", key] => node
                .submit(KvCommand::delete(*key).encode())
                .await
                .map(|index| format!("applied at {}", index)),
            ["get", key] => Ok(store.get(key).unwrap_or_else(|| "(nil)".to_string())),
            ["status"] => Ok(format!("{:#?}", node.status())),
            ["members"] => Ok(node
                .cluster_overview()
                .iter()
                .map(|m| format!("{} {} {}", m.id, m.address, m.role))
                .collect::<Vec<_>>()
                .join("\n")),
            ["add-member", id, address] => node
                .add_member(MemberId::new(*id), address.to_string())
                .await
                .map(|index| format!("membership committed at {}", index)),
            ["remove-member", id] => node
                .remove_member(MemberId::new(*id))
                .await
                .map(|index| format!("membership committed at {}", index)),
            ["add-replica", id, address] => node
                .add_read_replica(MemberId::new(*id), address.to_string())
                .await
                .map(|index| format!("membership committed at {}", index)),
            ["remove-replica", id] => node
                .remove_read_replica(MemberId::new(*id))
                .await
                .map(|index| format!("membership committed at {}", index)),
            ["await", index] => match index.parse::<u64>() {
                Ok(index) => node
                    .await_applied_at_least(index, Duration::from_secs(5))
                    .await
                    .map(|applied| format!("applied {}", applied)),
                Err(e) => Ok(format!("bad index: {}", e)),
            },
            ["snapshot"] => node.trigger_snapshot().map(|_| "snapshot requested".to_string()),
            ["quit"] | ["exit"] => break,
            _ => Ok(
                "commands: put K V | delete K | get K | status | members | add-member ID ADDR | \
                 remove-member ID | add-replica ID ADDR | remove-replica ID | await INDEX | \
                 snapshot | quit"
                    .to_string(),
            ),
        };
        match outcome {
            Ok(text) => println!("{}", text),
            Err(e) => println!("error: {}", e),
        }
    }

    node.shutdown().await;
    Ok(())
}
