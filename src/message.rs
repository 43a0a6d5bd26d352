use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::identity::StoreIdentity;
use crate::membership::{MembershipEntry, MembershipSet};
use crate::types::{Command, MemberId};

/// Serializes a value with the bincode serde configuration used for log
/// records and wire frames.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::error::DecodeError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard()).map(|(value, _)| value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// A client command handed to the state machine.
    Normal,
    /// An encoded `MembershipSet`.
    MembershipChange,
    /// Barrier appended by a new leader.
    Noop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub kind: EntryKind,
    pub command: Command,
}

impl LogEntry {
    pub fn normal(index: u64, term: u64, command: Command) -> Self {
        Self {
            index,
            term,
            kind: EntryKind::Normal,
            command,
        }
    }

    pub fn noop(index: u64, term: u64) -> Self {
        Self {
            index,
            term,
            kind: EntryKind::Noop,
            command: Vec::new(),
        }
    }

    pub fn membership(
        index: u64,
        term: u64,
        set: &MembershipSet,
    ) -> Result<Self, bincode::error::EncodeError> {
        Ok(Self {
            index,
            term,
            kind: EntryKind::MembershipChange,
            command: encode(set)?,
        })
    }

    /// Decodes the membership carried by a `MembershipChange` entry.
    pub fn membership_entry(&self) -> Option<Result<MembershipEntry, bincode::error::DecodeError>> {
        if self.kind != EntryKind::MembershipChange {
            return None;
        }
        Some(decode::<MembershipSet>(&self.command).map(|set| MembershipEntry {
            index: self.index,
            term: self.term,
            set,
        }))
    }
}

/// Durable vote state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<MemberId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub membership: MembershipEntry,
    pub store_id: StoreIdentity,
    pub size: u64,
    /// Hex encoded sha256 of the snapshot data.
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

/// Sent for both the pre-vote round and the real election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate: MemberId,
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub store_id: Option<StoreIdentity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader: MemberId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
    /// Highest index a majority of voters has applied; bounds log pruning.
    pub majority_applied: u64,
    pub store_id: StoreIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// Last index known to match the leader when `success` is set.
    pub match_index: u64,
    /// Hints for fast backtracking when `success` is false.
    pub conflict_index: Option<u64>,
    pub conflict_term: Option<u64>,
    /// The responder's applied index.
    pub applied_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader: MemberId,
    pub meta: SnapshotMeta,
    pub offset: u64,
    pub data: Vec<u8>,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallSnapshotState {
    /// More chunks expected, starting at `next_offset`.
    Receiving { next_offset: u64 },
    Installed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
    pub last_included_index: u64,
    pub state: InstallSnapshotState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    PreVoteRequest(VoteRequest),
    PreVoteResponse(VoteResponse),
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    AppendEntriesRequest(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshotRequest(InstallSnapshotRequest),
    InstallSnapshotResponse(InstallSnapshotResponse),
}

impl RaftMessage {
    pub fn term(&self) -> u64 {
        match self {
            RaftMessage::PreVoteRequest(r) | RaftMessage::VoteRequest(r) => r.term,
            RaftMessage::PreVoteResponse(r) | RaftMessage::VoteResponse(r) => r.term,
            RaftMessage::AppendEntriesRequest(r) => r.term,
            RaftMessage::AppendEntriesResponse(r) => r.term,
            RaftMessage::InstallSnapshotRequest(r) => r.term,
            RaftMessage::InstallSnapshotResponse(r) => r.term,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RaftMessage::PreVoteRequest(_) => "PreVoteRequest",
            RaftMessage::PreVoteResponse(_) => "PreVoteResponse",
            RaftMessage::VoteRequest(_) => "VoteRequest",
            RaftMessage::VoteResponse(_) => "VoteResponse",
            RaftMessage::AppendEntriesRequest(_) => "AppendEntriesRequest",
            RaftMessage::AppendEntriesResponse(_) => "AppendEntriesResponse",
            RaftMessage::InstallSnapshotRequest(_) => "InstallSnapshotRequest",
            RaftMessage::InstallSnapshotResponse(_) => "InstallSnapshotResponse",
        }
    }
}

/// A message addressed between two members; the unit carried by transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: MemberId,
    pub to: MemberId,
    pub message: RaftMessage,
}
