use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::applier::ApplyNotice;
use crate::error::ClientError;
use crate::membership::MembershipChange;
use crate::message::RaftMessage;
use crate::types::{Command, MemberId};

pub type ClientResult<T> = Result<T, ClientError>;

/// Input of the Raft state machine.
#[derive(Debug)]
pub enum Event {
    /// A message delivered by the transport.
    Message { from: MemberId, message: RaftMessage },

    /// A command to replicate; answered with its log index once applied.
    Propose {
        command: Command,
        reply: oneshot::Sender<ClientResult<u64>>,
    },

    /// A membership change; answered once the final set is committed.
    ChangeMembership {
        change: MembershipChange,
        reply: oneshot::Sender<ClientResult<u64>>,
    },

    /// Progress reported by the applier thread.
    Applied(ApplyNotice),

    /// Capture a snapshot now regardless of the threshold.
    TriggerSnapshot,

    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}
