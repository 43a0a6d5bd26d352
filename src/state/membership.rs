//! Membership changes driven by the leader.

use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{info, warn};

use super::{PendingChange, RaftState};
use crate::error::{ClientError, StorageError};
use crate::event::ClientResult;
use crate::membership::{MembershipChange, MembershipSet};
use crate::message::LogEntry;

impl RaftState {
    pub(crate) fn handle_change_membership(
        &mut self,
        change: MembershipChange,
        reply: oneshot::Sender<ClientResult<u64>>,
        now: Instant,
    ) {
        if !self.is_leader() {
            let _ = reply.send(Err(ClientError::NotLeader(self.leader_id())));
            return;
        }
        if let super::Health::Unhealthy { reason, .. } = &self.health {
            let _ = reply.send(Err(ClientError::Unhealthy(reason.clone())));
            return;
        }
        if self.pending_change.is_some() {
            let _ = reply.send(Err(ClientError::ConfigChangeInProgress));
            return;
        }
        let next = match self.membership.propose_change(&change) {
            Ok(next) => next,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return;
            }
        };
        info!("Member {} proposing membership change {:?}", self.id, change);
        match self.append_membership(next, now) {
            Some(index) => {
                self.pending_change = Some(PendingChange { index, reply });
                self.broadcast_append(now);
                self.maybe_commit(now);
            }
            None => {
                let _ = reply.send(Err(ClientError::Unhealthy(
                    "failed to append membership entry".into(),
                )));
            }
        }
    }

    fn append_membership(&mut self, set: MembershipSet, now: Instant) -> Option<u64> {
        let index = self.storage.last_index() + 1;
        let entry = match LogEntry::membership(index, self.current_term, &set) {
            Ok(entry) => entry,
            Err(e) => {
                self.faults.report(
                    &StorageError::Codec(e.to_string()),
                    "encode membership entry",
                    None,
                );
                return None;
            }
        };
        self.append_local(vec![entry], now).then_some(index)
    }

    /// Leader bookkeeping once the commit index moved: completes a joint
    /// transition, answers the admin request, and steps down when the leader
    /// is no longer a voter.
    pub(crate) fn on_membership_committed(&mut self, now: Instant) {
        let current = self.membership.current_entry();
        if current.index > self.commit_index {
            return;
        }
        if current.set.is_joint() {
            let next = match current.set.leave_joint() {
                Ok(next) => next,
                Err(e) => {
                    warn!("Member {} cannot leave joint consensus: {}", self.id, e);
                    return;
                }
            };
            info!(
                "Member {} joint membership committed, moving to voters {:?}",
                self.id, next.voters
            );
            if let Some(index) = self.append_membership(next, now) {
                if let Some(pending) = self.pending_change.as_mut() {
                    pending.index = index;
                }
                self.broadcast_append(now);
                self.maybe_commit(now);
            }
            return;
        }

        let index = current.index;
        if self
            .pending_change
            .as_ref()
            .is_some_and(|p| p.index <= self.commit_index)
        {
            if let Some(pending) = self.pending_change.take() {
                info!("Member {} membership change committed at {}", self.id, index);
                let _ = pending.reply.send(Ok(index));
            }
        }
        if !self.membership.current().is_voter(&self.id) {
            info!(
                "Member {} is no longer a voter, stepping down in term {}",
                self.id, self.current_term
            );
            self.become_follower(self.current_term, None, now);
        }
    }
}
