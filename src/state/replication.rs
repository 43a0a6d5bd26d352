//! Log replication and commit tracking.

use std::time::Instant;

use tracing::{debug, info, warn};

use super::{Progress, RaftState, RoleState};
use crate::applier::ApplyTask;
use crate::error::StorageError;
use crate::message::{AppendEntriesRequest, AppendEntriesResponse, LogEntry, RaftMessage};
use crate::types::MemberId;

impl RaftState {
    /// Persists entries locally and picks up any membership sets they carry.
    pub(crate) fn append_local(&mut self, entries: Vec<LogEntry>, now: Instant) -> bool {
        if entries.is_empty() {
            return true;
        }
        let result = self.storage.append(&entries);
        if self.faults.handle(result, "append log entries", None).is_none() {
            return false;
        }
        let mut membership_changed = false;
        for entry in &entries {
            match entry.membership_entry() {
                Some(Ok(decoded)) => {
                    self.membership.append(decoded);
                    membership_changed = true;
                }
                Some(Err(e)) => {
                    self.faults.report(
                        &StorageError::Codec(e.to_string()),
                        "decode membership entry",
                        None,
                    );
                    return false;
                }
                None => {}
            }
        }
        if membership_changed {
            self.sync_progress(now);
        }
        true
    }

    /// Keeps the leader's progress map in line with the current members.
    fn sync_progress(&mut self, now: Instant) {
        let members = self.membership.current().members();
        let next_index = self.storage.last_index() + 1;
        let RoleState::Leader(leader) = &mut self.role else {
            return;
        };
        leader.progress.retain(|m, _| members.contains(m));
        for member in members {
            if member != self.id && !leader.progress.contains_key(&member) {
                debug!("Member {} now replicating to {}", self.id, member);
                leader.progress.insert(member, Progress::new(next_index, now));
            }
        }
    }

    pub(crate) fn append_noop(&mut self, now: Instant) {
        let entry = LogEntry::noop(self.storage.last_index() + 1, self.current_term);
        if self.append_local(vec![entry], now) {
            self.broadcast_append(now);
            self.maybe_commit(now);
        }
    }

    pub(crate) fn broadcast_append(&mut self, now: Instant) {
        let peers: Vec<MemberId> = match &self.role {
            RoleState::Leader(leader) => leader.progress.keys().cloned().collect(),
            _ => return,
        };
        for peer in peers {
            self.send_append(&peer, now);
        }
    }

    /// Sends the next batch to `peer`, or continues a snapshot transfer when
    /// the entries it needs are no longer in the log.
    pub(crate) fn send_append(&mut self, peer: &MemberId, now: Instant) {
        let Some(store_id) = self.store_id else {
            return;
        };
        let (next_index, in_snapshot) = match &self.role {
            RoleState::Leader(leader) => match leader.progress.get(peer) {
                Some(p) => (p.next_index, p.snapshot.is_some()),
                None => return,
            },
            _ => return,
        };
        let prev_log_index = next_index - 1;
        if in_snapshot || prev_log_index < self.storage.prev_index() {
            self.send_snapshot(peer, now);
            return;
        }
        let prev_log_term = match self.storage.term_at(prev_log_index) {
            Ok(Some(term)) => term,
            Ok(None) => {
                self.send_snapshot(peer, now);
                return;
            }
            Err(e) => {
                self.faults.report(&e, "read log term", Some(peer));
                return;
            }
        };
        let high = (self.storage.last_index() + 1)
            .min(next_index + self.options.max_append_entries as u64);
        let entries = if next_index < high {
            match self.storage.entries(next_index, high) {
                Ok(entries) => entries,
                Err(StorageError::Compacted { .. }) => {
                    self.send_snapshot(peer, now);
                    return;
                }
                Err(e) => {
                    self.faults.report(&e, "read log entries", Some(peer));
                    return;
                }
            }
        } else {
            Vec::new()
        };

        if let RoleState::Leader(leader) = &mut self.role {
            if let Some(progress) = leader.progress.get_mut(peer) {
                progress.next_index = next_index + entries.len() as u64;
            }
        }
        let request = AppendEntriesRequest {
            term: self.current_term,
            leader: self.id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
            majority_applied: self.majority_applied,
            store_id,
        };
        self.send(peer, RaftMessage::AppendEntriesRequest(request));
    }

    fn reject_append(&mut self, to: &MemberId, conflict_index: Option<u64>, conflict_term: Option<u64>) {
        let response = AppendEntriesResponse {
            term: self.current_term,
            success: false,
            match_index: 0,
            conflict_index,
            conflict_term,
            applied_index: self.applied_index,
        };
        self.send(to, RaftMessage::AppendEntriesResponse(response));
    }

    pub(crate) fn handle_append_entries_request(
        &mut self,
        from: MemberId,
        req: AppendEntriesRequest,
        now: Instant,
    ) {
        if req.term < self.current_term {
            debug!(
                "Member {} rejects append from {} with stale term {} < {}",
                self.id, from, req.term, self.current_term
            );
            self.reject_append(&from, None, None);
            return;
        }
        if !self.accept_identity(&req.store_id, &from) {
            return;
        }
        self.become_follower(req.term, Some(req.leader.clone()), now);
        self.last_leader_contact = Some(now);
        self.reset_election_deadline(now);

        let mut prev_log_index = req.prev_log_index;
        let mut entries = req.entries;
        let snapshot_prev = self.storage.prev_index();
        if prev_log_index < snapshot_prev {
            // everything up to the local snapshot is committed and matches
            entries.retain(|e| e.index > snapshot_prev);
            prev_log_index = snapshot_prev;
        } else if prev_log_index > self.storage.last_index() {
            let conflict = self.storage.last_index() + 1;
            self.reject_append(&from, Some(conflict), None);
            return;
        } else {
            let local_term = match self.storage.term_at(prev_log_index) {
                Ok(term) => term.unwrap_or(0),
                Err(e) => {
                    self.faults.report(&e, "read log term", Some(&from));
                    return;
                }
            };
            if local_term != req.prev_log_term {
                let conflict = self.first_index_of_term(prev_log_index, local_term);
                debug!(
                    "Member {} log conflict at {} (term {} vs {}), hinting {}",
                    self.id, prev_log_index, local_term, req.prev_log_term, conflict
                );
                self.reject_append(&from, Some(conflict), Some(local_term));
                return;
            }
        }

        let match_index = entries.last().map_or(prev_log_index, |e| e.index);
        let mut first_new = entries.len();
        for (i, entry) in entries.iter().enumerate() {
            if entry.index > self.storage.last_index() {
                first_new = i;
                break;
            }
            match self.storage.term_at(entry.index) {
                Ok(Some(term)) if term == entry.term => continue,
                Ok(_) => {
                    let keep = entry.index - 1;
                    warn!(
                        "Member {} truncating conflicting entries after {}",
                        self.id, keep
                    );
                    let result = self.storage.truncate_after(keep);
                    if self.faults.handle(result, "truncate log", Some(&from)).is_none() {
                        return;
                    }
                    self.membership.truncate_after(keep);
                    first_new = i;
                    break;
                }
                Err(e) => {
                    self.faults.report(&e, "read log term", Some(&from));
                    return;
                }
            }
        }
        if first_new < entries.len() {
            let new_entries = entries.split_off(first_new);
            if !self.append_local(new_entries, now) {
                return;
            }
        }

        if req.leader_commit > self.commit_index {
            self.advance_commit(req.leader_commit.min(match_index), now);
        }
        self.note_majority_applied(req.majority_applied);

        let response = AppendEntriesResponse {
            term: self.current_term,
            success: true,
            match_index,
            conflict_index: None,
            conflict_term: None,
            applied_index: self.applied_index,
        };
        self.send(&from, RaftMessage::AppendEntriesResponse(response));
    }

    /// First index at or below `index` that still carries `term`.
    fn first_index_of_term(&self, index: u64, term: u64) -> u64 {
        let floor = self.storage.prev_index() + 1;
        let mut first = index;
        while first > floor {
            match self.storage.term_at(first - 1) {
                Ok(Some(t)) if t == term => first -= 1,
                _ => break,
            }
        }
        first
    }

    pub(crate) fn handle_append_entries_response(
        &mut self,
        from: MemberId,
        resp: AppendEntriesResponse,
        now: Instant,
    ) {
        if resp.term > self.current_term {
            self.become_follower(resp.term, None, now);
            return;
        }
        if resp.term < self.current_term {
            return;
        }
        let last_index = self.storage.last_index();
        let target = if resp.success {
            None
        } else {
            Some(self.backtrack_target(&resp))
        };
        let RoleState::Leader(leader) = &mut self.role else {
            return;
        };
        let Some(progress) = leader.progress.get_mut(&from) else {
            return;
        };
        progress.last_response = now;

        match target {
            None => {
                progress.applied_index = progress.applied_index.max(resp.applied_index);
                // a stale or duplicate acknowledgement only carries the applied index
                if resp.match_index > progress.match_index {
                    progress.match_index = resp.match_index;
                    progress.next_index = progress.next_index.max(resp.match_index + 1);
                    let more = progress.next_index <= last_index;
                    self.maybe_commit(now);
                    if more {
                        self.send_append(&from, now);
                    }
                }
                self.update_majority_applied();
            }
            Some(target) => {
                if progress.snapshot.is_some() {
                    return;
                }
                let next = target.max(progress.match_index + 1);
                debug!(
                    "Member {} backtracking {} from {} to {}",
                    self.id, from, progress.next_index, next
                );
                progress.next_index = next;
                self.send_append(&from, now);
            }
        }
    }

    /// Next index to try after a rejection, skipping whole terms.
    fn backtrack_target(&self, resp: &AppendEntriesResponse) -> u64 {
        let Some(conflict_index) = resp.conflict_index else {
            return 1;
        };
        let Some(conflict_term) = resp.conflict_term else {
            return conflict_index;
        };
        let floor = self.storage.prev_index();
        let mut index = self.storage.last_index();
        while index > floor {
            match self.storage.term_at(index) {
                Ok(Some(term)) if term == conflict_term => return index + 1,
                Ok(Some(term)) if term < conflict_term => break,
                Ok(Some(_)) => index -= 1,
                _ => break,
            }
        }
        conflict_index
    }

    /// Commits the highest index stored on a quorum, if it is from the
    /// current term.
    pub(crate) fn maybe_commit(&mut self, now: Instant) {
        let RoleState::Leader(leader) = &self.role else {
            return;
        };
        let last_index = self.storage.last_index();
        let candidate = self.membership.current().quorum_index(|m| {
            if *m == self.id {
                last_index
            } else {
                leader.progress.get(m).map_or(0, |p| p.match_index)
            }
        });
        if candidate <= self.commit_index {
            return;
        }
        match self.storage.term_at(candidate) {
            Ok(Some(term)) if term == self.current_term => self.advance_commit(candidate, now),
            Ok(_) => {}
            Err(e) => self.faults.report(&e, "read log term", None),
        }
    }

    /// Recomputes the highest index applied on a majority of voters from
    /// what followers report.
    pub(crate) fn update_majority_applied(&mut self) {
        let RoleState::Leader(leader) = &self.role else {
            return;
        };
        let index = self.membership.current().quorum_index(|m| {
            if *m == self.id {
                self.applied_index
            } else {
                leader.progress.get(m).map_or(0, |p| p.applied_index)
            }
        });
        self.note_majority_applied(index);
    }

    pub(crate) fn note_majority_applied(&mut self, index: u64) {
        if index <= self.majority_applied {
            return;
        }
        self.majority_applied = index;
        self.storage.mark_majority_applied(index);
        self.compact_log();
    }

    pub(crate) fn advance_commit(&mut self, index: u64, now: Instant) {
        if index <= self.commit_index {
            return;
        }
        debug!("Member {} commit index {} -> {}", self.id, self.commit_index, index);
        self.commit_index = index;
        self.storage.mark_committed(index);
        if self.membership.commit(index) {
            info!(
                "Member {} committed membership at index {}: voters {:?}",
                self.id,
                self.membership.committed().index,
                self.membership.committed().set.voters
            );
        }
        self.dispatch_committed();
        if self.is_leader() {
            self.on_membership_committed(now);
        }
    }

    /// Hands committed entries that the applier has not seen yet.
    pub(crate) fn dispatch_committed(&mut self) {
        if !self.health.is_healthy() {
            return;
        }
        let batch = self.options.max_append_entries.max(1) as u64;
        while self.dispatched_index < self.commit_index {
            let low = self.dispatched_index + 1;
            let high = (self.commit_index + 1).min(low + batch);
            let entries = match self.storage.entries(low, high) {
                Ok(entries) => entries,
                Err(e) => {
                    self.faults.report(&e, "read committed entries", None);
                    return;
                }
            };
            if !self.applier.submit(ApplyTask::Apply(entries)) {
                warn!("Member {} applier is gone", self.id);
                return;
            }
            self.dispatched_index = high - 1;
        }
    }
}
