pub mod applier;
pub mod config;
pub mod consistency;
pub mod error;
pub mod event;
pub mod identity;
pub mod kv;
pub mod membership;
pub mod message;
pub mod network;
pub mod node;
pub mod state;
pub mod storage;
pub mod traits;
pub mod transfer;
pub mod types;

pub use config::{NodeConfig, RaftOptions};
pub use consistency::ConsistencyTracker;
pub use error::{ClientError, RaftError, RpcError, StorageError};
pub use event::{ClientResult, Role};
pub use identity::StoreIdentity;
pub use kv::{KvCommand, KvStore};
pub use membership::{MembershipChange, MembershipSet};
pub use network::{MemoryNetwork, TcpNetwork};
pub use node::{ClusterMember, Inbox, MemberRole, RaftNode};
pub use state::{Health, NodeStatus};
pub use storage::{FileStorage, FileStorageOptions, MemoryStorage};
pub use traits::{Network, StateMachine, Storage};
pub use types::MemberId;
