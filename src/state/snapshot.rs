//! Snapshot capture, log compaction and snapshot install.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::{Health, RaftState, RoleState};
use crate::applier::{ApplyNotice, ApplyTask};
use crate::error::ClientError;
use crate::message::{
    InstallSnapshotRequest, InstallSnapshotResponse, InstallSnapshotState, RaftMessage, Snapshot,
    SnapshotMeta,
};
use crate::storage::snapshot::calculate_checksum;
use crate::transfer::{ChunkOutcome, OutgoingSnapshot, SnapshotReceiver};
use crate::types::MemberId;

impl RaftState {
    pub(crate) fn handle_apply_notice(&mut self, notice: ApplyNotice, now: Instant) {
        match notice {
            ApplyNotice::Applied { index, outcomes } => {
                self.on_applied(index);
                debug!(
                    "Member {} applied up to {} ({} commands)",
                    self.id,
                    index,
                    outcomes.len()
                );
            }
            ApplyNotice::Failed { index, error } => {
                let reason = format!("apply of index {} failed: {}", index, error);
                self.health = Health::Unhealthy {
                    index,
                    reason: reason.clone(),
                };
                self.fail_pending(ClientError::Unhealthy(reason));
                if self.is_leader() {
                    warn!(
                        "Member {} cannot apply index {}, giving up leadership",
                        self.id, index
                    );
                    self.become_follower(self.current_term, None, now);
                }
            }
            ApplyNotice::Restored { index } => {
                self.health = Health::Healthy;
                self.on_applied(index);
                self.dispatch_committed();
            }
            ApplyNotice::SnapshotTaken { index, term, data } => {
                self.snapshot_in_progress = false;
                self.persist_snapshot(index, term, data);
                // applies that landed during the capture may already cross the threshold
                self.maybe_snapshot();
            }
            ApplyNotice::SnapshotFailed(e) => {
                self.snapshot_in_progress = false;
                warn!("Member {} snapshot capture failed: {}", self.id, e);
            }
        }
    }

    fn on_applied(&mut self, index: u64) {
        if index > self.applied_index {
            self.applied_index = index;
            self.storage.mark_applied(index);
            self.update_majority_applied();
        }
        let still_pending = self.pending.split_off(&(index + 1));
        for (log_index, reply) in std::mem::replace(&mut self.pending, still_pending) {
            let _ = reply.send(Ok(log_index));
        }
        self.maybe_snapshot();
    }

    fn maybe_snapshot(&mut self) {
        let threshold = self.options.snapshot_threshold;
        if threshold > 0 && self.applied_index.saturating_sub(self.snapshot_index) >= threshold {
            self.request_snapshot();
        }
    }

    /// Asks the applier to capture the state machine at its applied index.
    pub(crate) fn request_snapshot(&mut self) {
        if self.snapshot_in_progress || self.applied_index <= self.snapshot_index {
            return;
        }
        debug!(
            "Member {} requesting snapshot at applied index {}",
            self.id, self.applied_index
        );
        self.snapshot_in_progress = self.applier.submit(ApplyTask::TakeSnapshot);
    }

    /// Saves a captured snapshot and compacts the log behind it.
    fn persist_snapshot(&mut self, index: u64, term: u64, data: Vec<u8>) {
        if index <= self.snapshot_index {
            return;
        }
        let Some(store_id) = self.store_id else {
            warn!("Member {} has no store identity, not saving snapshot", self.id);
            return;
        };
        let snapshot = Snapshot {
            meta: SnapshotMeta {
                last_included_index: index,
                last_included_term: term,
                membership: self.membership.entry_at(index).clone(),
                store_id,
                size: data.len() as u64,
                checksum: calculate_checksum(&data),
            },
            data,
        };
        let result = self.storage.save_snapshot(&snapshot);
        if self.faults.handle(result, "save snapshot", None).is_none() {
            return;
        }
        info!(
            "Member {} saved snapshot at index {} term {} ({} bytes)",
            self.id, index, term, snapshot.meta.size
        );
        self.snapshot_index = index;
        self.cached_snapshot = Some(Arc::new(snapshot));
        self.compact_log();
    }

    /// Drops entries covered by the snapshot, keeping `log_retention` of them
    /// and every entry a majority of voters has not applied yet.
    pub(crate) fn compact_log(&mut self) {
        if self.snapshot_index == 0 {
            return;
        }
        let keep_from = (self.snapshot_index + 1)
            .saturating_sub(self.options.log_retention)
            .max(1);
        let safe = self.applied_index.min(self.majority_applied) + 1;
        let prune_to = keep_from.min(safe);
        if prune_to <= self.storage.first_index() {
            if keep_from > prune_to {
                debug!(
                    "Member {} holds log before {} until a majority applies it",
                    self.id, keep_from
                );
            }
            return;
        }
        let result = self.storage.prune_before(prune_to);
        if let Some(first) = self.faults.handle(result, "prune log", None) {
            self.membership.compact(first);
            debug!("Member {} log now starts at {}", self.id, first);
        }
    }

    fn latest_snapshot(&mut self) -> Option<Arc<Snapshot>> {
        let floor = self.storage.prev_index();
        if let Some(cached) = &self.cached_snapshot {
            if cached.meta.last_included_index >= floor {
                return Some(cached.clone());
            }
        }
        let loaded = self.storage.load_snapshot();
        let snapshot = self.faults.handle(loaded, "load snapshot", None)??;
        let snapshot = Arc::new(snapshot);
        self.cached_snapshot = Some(snapshot.clone());
        Some(snapshot)
    }

    /// Sends the next snapshot chunk to `peer` unless one is still in flight.
    pub(crate) fn send_snapshot(&mut self, peer: &MemberId, now: Instant) {
        let needs_transfer = match &self.role {
            RoleState::Leader(leader) => match leader.progress.get(peer) {
                Some(progress) => progress.snapshot.is_none(),
                None => return,
            },
            _ => return,
        };
        let fresh = if needs_transfer {
            match self.latest_snapshot() {
                Some(snapshot) => Some(OutgoingSnapshot::new(snapshot)),
                None => {
                    warn!("Member {} has no snapshot to send to {}", self.id, peer);
                    self.request_snapshot();
                    return;
                }
            }
        } else {
            None
        };

        let term = self.current_term;
        let chunk_size = self.options.snapshot_chunk_size;
        let retry = self.options.snapshot_retry_interval;
        let RoleState::Leader(leader) = &mut self.role else {
            return;
        };
        let Some(progress) = leader.progress.get_mut(peer) else {
            return;
        };
        if let Some(fresh) = fresh {
            info!(
                "Member {} sending snapshot at index {} to {}",
                self.id,
                fresh.index(),
                peer
            );
            progress.snapshot = Some(fresh);
        }
        let Some(transfer) = progress.snapshot.as_mut() else {
            return;
        };
        if !transfer.should_send(now, retry) {
            return;
        }
        let request = transfer.next_request(term, &self.id, chunk_size, now);
        self.send(peer, RaftMessage::InstallSnapshotRequest(request));
    }

    fn respond_snapshot(&mut self, to: &MemberId, index: u64, state: InstallSnapshotState) {
        let response = InstallSnapshotResponse {
            term: self.current_term,
            last_included_index: index,
            state,
        };
        self.send(to, RaftMessage::InstallSnapshotResponse(response));
    }

    pub(crate) fn handle_install_snapshot_request(
        &mut self,
        from: MemberId,
        req: InstallSnapshotRequest,
        now: Instant,
    ) {
        let index = req.meta.last_included_index;
        if req.term < self.current_term {
            self.respond_snapshot(&from, index, InstallSnapshotState::Failed("stale term".into()));
            return;
        }
        if !self.accept_identity(&req.meta.store_id, &from) {
            return;
        }
        self.become_follower(req.term, Some(req.leader.clone()), now);
        self.last_leader_contact = Some(now);
        self.reset_election_deadline(now);
        if index <= self.commit_index {
            debug!(
                "Member {} already has snapshot index {} committed ({})",
                self.id, index, self.commit_index
            );
            self.receiver = None;
            self.respond_snapshot(&from, index, InstallSnapshotState::Installed);
            return;
        }

        let current = self.receiver.as_ref().is_some_and(|r| r.is_for(&req.meta));
        if !current {
            if req.offset != 0 {
                self.respond_snapshot(
                    &from,
                    index,
                    InstallSnapshotState::Receiving { next_offset: 0 },
                );
                return;
            }
            debug!(
                "Member {} receiving snapshot at index {} ({} bytes) from {}",
                self.id, index, req.meta.size, from
            );
            self.receiver = Some(SnapshotReceiver::new(
                req.meta.clone(),
                self.options.snapshot_chunk_size,
            ));
        }
        let Some(receiver) = self.receiver.as_mut() else {
            return;
        };
        let state = match receiver.accept(req.offset, &req.data, req.done) {
            ChunkOutcome::Expecting(next_offset) => InstallSnapshotState::Receiving { next_offset },
            ChunkOutcome::Complete(snapshot) => {
                self.receiver = None;
                if self.install(snapshot) {
                    InstallSnapshotState::Installed
                } else {
                    InstallSnapshotState::Failed("install failed".into())
                }
            }
            ChunkOutcome::Corrupt(e) => {
                self.receiver = None;
                self.faults.report(&e, "receive snapshot", Some(&from));
                InstallSnapshotState::Failed(e.to_string())
            }
        };
        self.respond_snapshot(&from, index, state);
    }

    /// Replaces the local log and state with a received snapshot.
    fn install(&mut self, snapshot: Snapshot) -> bool {
        let meta = snapshot.meta.clone();
        let index = meta.last_included_index;
        let result = self.storage.save_snapshot(&snapshot);
        if self.faults.handle(result, "save snapshot", None).is_none() {
            return false;
        }
        let result = self.storage.reset(index, meta.last_included_term);
        if self.faults.handle(result, "reset log", None).is_none() {
            return false;
        }
        self.membership.reset(meta.membership.clone());
        self.commit_index = index;
        self.dispatched_index = index;
        self.snapshot_index = index;
        self.store_id = Some(meta.store_id);
        self.cached_snapshot = Some(Arc::new(snapshot.clone()));
        self.snapshots_installed += 1;
        if !self.applier.submit(ApplyTask::Restore(snapshot)) {
            warn!("Member {} applier is gone", self.id);
            return false;
        }
        info!(
            "Member {} installed snapshot at index {} term {}",
            self.id, index, meta.last_included_term
        );
        true
    }

    pub(crate) fn handle_install_snapshot_response(
        &mut self,
        from: MemberId,
        resp: InstallSnapshotResponse,
        now: Instant,
    ) {
        if resp.term > self.current_term {
            self.become_follower(resp.term, None, now);
            return;
        }
        if resp.term < self.current_term {
            return;
        }
        let RoleState::Leader(leader) = &mut self.role else {
            return;
        };
        let Some(progress) = leader.progress.get_mut(&from) else {
            return;
        };
        progress.last_response = now;
        let in_flight = progress
            .snapshot
            .as_ref()
            .is_some_and(|s| s.index() == resp.last_included_index);

        match resp.state {
            InstallSnapshotState::Receiving { next_offset } => {
                if !in_flight {
                    return;
                }
                if let Some(transfer) = progress.snapshot.as_mut() {
                    transfer.ack(next_offset);
                }
                self.send_snapshot(&from, now);
            }
            InstallSnapshotState::Installed => {
                if in_flight {
                    progress.snapshot = None;
                }
                if resp.last_included_index > progress.match_index {
                    progress.match_index = resp.last_included_index;
                }
                progress.next_index = progress.next_index.max(progress.match_index + 1);
                info!(
                    "Member {} follower {} installed snapshot at {}",
                    self.id, from, resp.last_included_index
                );
                self.maybe_commit(now);
                self.send_append(&from, now);
            }
            InstallSnapshotState::Failed(reason) => {
                if in_flight {
                    warn!(
                        "Member {} snapshot transfer to {} failed: {}",
                        self.id, from, reason
                    );
                    progress.snapshot = None;
                }
            }
        }
    }
}

