//! Client command proposals.

use std::time::Instant;

use tokio::sync::oneshot;
use tracing::trace;

use super::{Health, RaftState};
use crate::error::ClientError;
use crate::event::ClientResult;
use crate::message::LogEntry;
use crate::types::Command;

impl RaftState {
    /// Appends a command as leader; the reply is sent once it is applied.
    pub(crate) fn handle_propose(
        &mut self,
        command: Command,
        reply: oneshot::Sender<ClientResult<u64>>,
        now: Instant,
    ) {
        if !self.is_leader() {
            let _ = reply.send(Err(ClientError::NotLeader(self.leader_id())));
            return;
        }
        if let Health::Unhealthy { reason, .. } = &self.health {
            let _ = reply.send(Err(ClientError::Unhealthy(reason.clone())));
            return;
        }
        let index = self.storage.last_index() + 1;
        let entry = LogEntry::normal(index, self.current_term, command);
        if !self.append_local(vec![entry], now) {
            let reason = self.faults.fatal().unwrap_or("log append failed").to_string();
            let _ = reply.send(Err(ClientError::Unhealthy(reason)));
            return;
        }
        trace!("Member {} appended command at {}", self.id, index);
        self.pending.insert(index, reply);
        self.broadcast_append(now);
        self.maybe_commit(now);
    }
}
