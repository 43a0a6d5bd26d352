use async_trait::async_trait;

use crate::error::{ApplyError, RpcError, StorageError};
use crate::identity::StoreIdentity;
use crate::message::{HardState, LogEntry, RaftMessage, Snapshot, SnapshotMeta};
use crate::types::MemberId;

pub type StorageResult<T> = Result<T, StorageError>;
pub type ApplyResult<T> = Result<T, ApplyError>;
pub type RpcResult<T> = Result<T, RpcError>;

pub trait HardStateStorage: Send {
    fn save_hard_state(&mut self, state: &HardState) -> StorageResult<()>;

    fn load_hard_state(&self) -> StorageResult<Option<HardState>>;
}

/// Durable, ordered sequence of log entries.
///
/// Indexes start at 1. After pruning the log remembers the index and term of
/// the last removed entry (`prev_index`, `prev_term`), so `term_at` keeps
/// answering for the boundary.
pub trait LogStorage: Send {
    /// Appends contiguous entries and returns the new last index once they
    /// are durable.
    fn append(&mut self, entries: &[LogEntry]) -> StorageResult<u64>;

    fn entry(&self, index: u64) -> StorageResult<Option<LogEntry>>;

    /// Entries in `[low, high)`.
    fn entries(&self, low: u64, high: u64) -> StorageResult<Vec<LogEntry>>;

    /// Removes every entry after `index`. Fails for committed entries.
    fn truncate_after(&mut self, index: u64) -> StorageResult<()>;

    /// Removes every entry before `index`. Fails for entries not yet applied
    /// locally and on a majority of voters. Returns the new first index.
    fn prune_before(&mut self, index: u64) -> StorageResult<u64>;

    /// Discards the whole log; the next entry will be `prev_index + 1`.
    fn reset(&mut self, prev_index: u64, prev_term: u64) -> StorageResult<()>;

    fn first_index(&self) -> u64;

    fn last_index(&self) -> u64;

    fn prev_index(&self) -> u64;

    fn prev_term(&self) -> u64;

    fn term_at(&self, index: u64) -> StorageResult<Option<u64>>;

    fn mark_committed(&mut self, index: u64);

    fn mark_applied(&mut self, index: u64);

    /// Records the highest index a majority of voters has applied.
    fn mark_majority_applied(&mut self, index: u64);

    fn last_term(&self) -> StorageResult<u64> {
        let last = self.last_index();
        Ok(self.term_at(last)?.unwrap_or(0))
    }
}

pub trait SnapshotStorage: Send {
    fn save_snapshot(&mut self, snapshot: &Snapshot) -> StorageResult<()>;

    fn load_snapshot(&self) -> StorageResult<Option<Snapshot>>;

    fn snapshot_meta(&self) -> StorageResult<Option<SnapshotMeta>>;
}

pub trait Storage: HardStateStorage + LogStorage + SnapshotStorage {}

impl<T: HardStateStorage + LogStorage + SnapshotStorage> Storage for T {}

/// The replicated storage engine.
///
/// Calls arrive from a single applier thread, strictly in log order.
pub trait StateMachine: Send + Sync {
    /// Applies a committed command and returns the engine's transaction id.
    fn apply(&self, index: u64, command: &[u8]) -> ApplyResult<u64>;

    /// Captures the full state as of the last applied index.
    fn snapshot(&self) -> ApplyResult<Vec<u8>>;

    /// Replaces the full state atomically.
    fn restore(&self, index: u64, identity: StoreIdentity, data: &[u8]) -> ApplyResult<()>;

    fn identity(&self) -> Option<StoreIdentity>;

    fn initialize(&self, identity: StoreIdentity) -> ApplyResult<()>;

    fn is_empty(&self) -> bool;

    /// Log index of the last applied command, zero for a fresh store.
    fn last_applied(&self) -> u64;
}

#[async_trait]
pub trait Network: Send + Sync {
    async fn send(&self, from: &MemberId, target: &MemberId, message: RaftMessage) -> RpcResult<()>;

    /// Called whenever the membership reveals a member's address.
    fn register_address(&self, _member: &MemberId, _address: &str) {}
}
