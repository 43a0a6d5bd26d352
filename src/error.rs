use thiserror::Error;
use tracing::{debug, error, warn};

use crate::identity::StoreIdentity;
use crate::types::MemberId;

/// Top level error of the consensus subsystem.
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Membership error: {0}")]
    Membership(#[from] MembershipError),

    #[error("Store identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Node is shut down")]
    Shutdown,
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Target member {0} is unreachable")]
    Unreachable(MemberId),

    #[error("No address known for member {0}")]
    UnknownAddress(MemberId),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Outgoing queue to {0} is full")]
    QueueFull(MemberId),
}

/// Durable storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Log entry at index {0} not found")]
    LogNotFound(u64),

    #[error("Log entry at index {index} was pruned (first index {first})")]
    Compacted { index: u64, first: u64 },

    #[error("Corrupted record in segment {segment} at offset {offset}")]
    DataCorruption { segment: u64, offset: u64 },

    #[error("Refusing to truncate after {index}: entries up to {committed} are committed")]
    IllegalTruncate { index: u64, committed: u64 },

    #[error("Refusing to prune before {index}: only {applied} applied here and on a majority")]
    UnsafePrune { index: u64, applied: u64 },

    #[error("Non-contiguous append: expected index {expected}, got {got}")]
    NonContiguous { expected: u64, got: u64 },

    #[error("Consistency check failed: {0}")]
    Consistency(String),
}

impl From<bincode::error::EncodeError> for StorageError {
    fn from(e: bincode::error::EncodeError) -> Self {
        StorageError::Codec(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for StorageError {
    fn from(e: bincode::error::DecodeError) -> Self {
        StorageError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Codec(e.to_string())
    }
}

/// Errors surfaced to callers of the public node API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("Not leader (current leader: {0:?})")]
    NotLeader(Option<MemberId>),

    #[error("Leadership lost before the request completed")]
    LeadershipLost,

    #[error("Timed out waiting for index {target} (applied {applied})")]
    Timeout { target: u64, applied: u64 },

    #[error("Request was not answered in time")]
    RequestTimeout,

    #[error("A membership change is already in progress")]
    ConfigChangeInProgress,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Member is unhealthy: {0}")]
    Unhealthy(String),

    #[error("Node is shut down")]
    Shutdown,
}

/// Errors reported by the state machine collaborator.
#[derive(Debug, Clone, Error)]
pub enum ApplyError {
    #[error("Command at index {0} is malformed: {1}")]
    Malformed(u64, String),

    #[error("Snapshot data rejected: {0}")]
    BadSnapshot(String),

    #[error("State machine error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("No snapshot available")]
    NotFound,

    #[error("Checksum mismatch (expected {expected}, got {actual})")]
    Checksum { expected: String, actual: String },

    #[error("Size mismatch (expected {expected}, got {actual})")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Snapshot storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Membership change errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MembershipError {
    #[error("Voter set would be empty")]
    EmptyVoters,

    #[error("Member {0} is already part of the cluster")]
    AlreadyMember(MemberId),

    #[error("Member {0} is not part of the cluster")]
    NotMember(MemberId),

    #[error("Already in joint consensus")]
    AlreadyInJoint,

    #[error("Not in joint consensus")]
    NotInJoint,

    #[error("A membership change is already in progress")]
    ChangeInProgress,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Store identity mismatch: local {local}, remote {remote}")]
    Mismatch {
        local: StoreIdentity,
        remote: StoreIdentity,
    },

    #[error("Local store is not empty but carries no identity")]
    Unidentified,
}

impl From<MembershipError> for ClientError {
    fn from(e: MembershipError) -> Self {
        match e {
            MembershipError::ChangeInProgress => ClientError::ConfigChangeInProgress,
            other => ClientError::BadRequest(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// The member cannot safely continue.
    Fatal,
    /// The operation failed but may be retried.
    Recoverable,
    /// Only worth a log line.
    Ignorable,
}

pub trait ErrorHandler {
    fn severity(&self) -> ErrorSeverity;
    fn context(&self) -> String;
}

impl ErrorHandler for RpcError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            RpcError::Unreachable(_) => ErrorSeverity::Ignorable,
            RpcError::UnknownAddress(_) => ErrorSeverity::Recoverable,
            RpcError::Network(_) => ErrorSeverity::Recoverable,
            RpcError::Codec(_) => ErrorSeverity::Recoverable,
            RpcError::QueueFull(_) => ErrorSeverity::Ignorable,
        }
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

impl ErrorHandler for StorageError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            StorageError::Io(_) => ErrorSeverity::Fatal,
            StorageError::Codec(_) => ErrorSeverity::Fatal,
            StorageError::LogNotFound(_) => ErrorSeverity::Recoverable,
            StorageError::Compacted { .. } => ErrorSeverity::Recoverable,
            StorageError::DataCorruption { .. } => ErrorSeverity::Fatal,
            StorageError::IllegalTruncate { .. } => ErrorSeverity::Fatal,
            StorageError::UnsafePrune { .. } => ErrorSeverity::Recoverable,
            StorageError::NonContiguous { .. } => ErrorSeverity::Fatal,
            StorageError::Consistency(_) => ErrorSeverity::Fatal,
        }
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

impl ErrorHandler for SnapshotError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            SnapshotError::NotFound => ErrorSeverity::Recoverable,
            SnapshotError::Checksum { .. } => ErrorSeverity::Recoverable,
            SnapshotError::SizeMismatch { .. } => ErrorSeverity::Recoverable,
            SnapshotError::Storage(e) => e.severity(),
        }
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

impl ErrorHandler for ApplyError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            ApplyError::Malformed(..) => ErrorSeverity::Fatal,
            ApplyError::BadSnapshot(_) => ErrorSeverity::Fatal,
            ApplyError::Internal(_) => ErrorSeverity::Recoverable,
        }
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

impl ErrorHandler for IdentityError {
    fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::Fatal
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

/// Logs failed operations by severity and latches the first fatal one.
#[derive(Debug)]
pub struct FaultHandler {
    member: MemberId,
    fatal: Option<String>,
}

impl FaultHandler {
    pub fn new(member: MemberId) -> Self {
        Self {
            member,
            fatal: None,
        }
    }

    pub fn handle<T, E: ErrorHandler>(
        &mut self,
        result: Result<T, E>,
        operation: &str,
        target: Option<&MemberId>,
    ) -> Option<T> {
        match result {
            Ok(val) => Some(val),
            Err(e) => {
                self.report(&e, operation, target);
                None
            }
        }
    }

    pub fn report<E: ErrorHandler>(&mut self, e: &E, operation: &str, target: Option<&MemberId>) {
        let ctx = match target {
            Some(t) => format!("{} from {} to {}", operation, self.member, t),
            None => format!("{} on {}", operation, self.member),
        };
        match e.severity() {
            ErrorSeverity::Fatal => {
                error!("[FATAL] {} failed: {} - stopping member", ctx, e.context());
                if self.fatal.is_none() {
                    self.fatal = Some(format!("{}: {}", ctx, e.context()));
                }
            }
            ErrorSeverity::Recoverable => {
                warn!("[RECOVERABLE] {} failed: {}", ctx, e.context());
            }
            ErrorSeverity::Ignorable => {
                debug!("[IGNORED] {} failed: {}", ctx, e.context());
            }
        }
    }

    pub fn fatal(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors_latch_first_reason() {
        let mut handler = FaultHandler::new(MemberId::new("core-0"));
        let r: Result<(), StorageError> = Err(StorageError::UnsafePrune {
            index: 10,
            applied: 3,
        });
        assert!(handler.handle(r, "prune", None).is_none());
        assert!(!handler.is_fatal());

        handler.report(
            &StorageError::IllegalTruncate {
                index: 2,
                committed: 5,
            },
            "truncate",
            None,
        );
        handler.report(&StorageError::Consistency("later".into()), "append", None);
        let reason = handler.fatal().unwrap();
        assert!(reason.contains("truncate"));
        assert!(!reason.contains("later"));
    }

    #[test]
    fn membership_errors_map_to_client_errors() {
        assert_eq!(
            ClientError::from(MembershipError::ChangeInProgress),
            ClientError::ConfigChangeInProgress
        );
        assert!(matches!(
            ClientError::from(MembershipError::EmptyVoters),
            ClientError::BadRequest(_)
        ));
    }
}
