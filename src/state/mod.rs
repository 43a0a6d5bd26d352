//! The Raft role state machine.
//!
//! `RaftState` is driven by `step` and `tick` from a single task and never
//! awaits: outgoing messages are queued in an outbox that the node runtime
//! drains after every call, storage is synchronous, and state machine work is
//! handed to the applier thread.

mod client;
mod election;
mod membership;
mod replication;
mod snapshot;


use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::applier::{ApplierHandle, ApplyNotice};
use crate::config::RaftOptions;
use crate::consistency::ConsistencyTracker;
use crate::error::{ClientError, FaultHandler, RaftError, SnapshotError, StorageError};
use crate::event::{ClientResult, Event, Role};
use crate::identity::{Compatibility, StoreIdentity, verify_compatible};
use crate::membership::{MembershipEntry, MembershipRegistry, MembershipSet};
use crate::message::{HardState, RaftMessage, Snapshot};
use crate::traits::{StateMachine, Storage};
use crate::transfer::{OutgoingSnapshot, SnapshotReceiver};
use crate::types::MemberId;

/// Leader's view of one follower.
#[derive(Debug)]
pub struct Progress {
    pub next_index: u64,
    pub match_index: u64,
    /// Last applied index the follower reported.
    pub applied_index: u64,
    pub last_response: Instant,
    pub snapshot: Option<OutgoingSnapshot>,
}

impl Progress {
    fn new(next_index: u64, now: Instant) -> Self {
        Self {
            next_index,
            match_index: 0,
            applied_index: 0,
            last_response: now,
            snapshot: None,
        }
    }
}

#[derive(Debug)]
pub struct LeaderState {
    pub progress: HashMap<MemberId, Progress>,
    pub since: Instant,
    pub heartbeat_due: Instant,
}

#[derive(Debug)]
pub enum RoleState {
    Follower {
        leader: Option<MemberId>,
        /// Set while a pre-vote round is running.
        pre_votes: Option<HashSet<MemberId>>,
    },
    Candidate {
        votes: HashSet<MemberId>,
    },
    Leader(LeaderState),
}

impl RoleState {
    pub fn role(&self) -> Role {
        match self {
            RoleState::Follower { .. } => Role::Follower,
            RoleState::Candidate { .. } => Role::Candidate,
            RoleState::Leader(_) => Role::Leader,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Health {
    Healthy,
    /// The applier could not apply `index`; nothing after it is applied.
    Unhealthy { index: u64, reason: String },
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Health::Healthy)
    }
}

pub(crate) struct PendingChange {
    /// Index whose commit completes the change.
    index: u64,
    reply: oneshot::Sender<ClientResult<u64>>,
}

/// Point-in-time view of a member, published after every step.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub id: MemberId,
    pub role: Role,
    pub term: u64,
    pub leader: Option<MemberId>,
    pub commit_index: u64,
    pub applied_index: u64,
    pub majority_applied: u64,
    pub first_log_index: u64,
    pub last_log_index: u64,
    pub snapshot_index: u64,
    pub snapshots_installed: u64,
    pub membership: MembershipSet,
    pub membership_index: u64,
    pub store_id: Option<StoreIdentity>,
    pub health: Health,
    pub fatal: Option<String>,
}

pub struct RaftState {
    pub(crate) id: MemberId,
    pub(crate) options: RaftOptions,
    pub(crate) role: RoleState,
    pub(crate) current_term: u64,
    pub(crate) voted_for: Option<MemberId>,

    pub(crate) commit_index: u64,
    pub(crate) applied_index: u64,
    /// Highest index known to be applied on a majority of voters.
    pub(crate) majority_applied: u64,
    /// Highest index handed to the applier.
    pub(crate) dispatched_index: u64,

    pub(crate) storage: Box<dyn Storage>,
    pub(crate) membership: MembershipRegistry,
    pub(crate) state_machine: Arc<dyn StateMachine>,
    pub(crate) applier: ApplierHandle,
    pub(crate) store_id: Option<StoreIdentity>,

    pub(crate) snapshot_index: u64,
    pub(crate) snapshot_in_progress: bool,
    pub(crate) snapshots_installed: u64,
    pub(crate) cached_snapshot: Option<Arc<Snapshot>>,
    pub(crate) receiver: Option<SnapshotReceiver>,

    pub(crate) pending: BTreeMap<u64, oneshot::Sender<ClientResult<u64>>>,
    pub(crate) pending_change: Option<PendingChange>,

    pub(crate) election_deadline: Instant,
    pub(crate) last_leader_contact: Option<Instant>,
    pub(crate) health: Health,
    pub(crate) faults: FaultHandler,
    pub(crate) outbox: Vec<(MemberId, RaftMessage)>,
}

impl RaftState {
    /// Loads persisted state, restores the state machine from the local
    /// snapshot if it is behind, and spawns the applier.
    pub fn new(
        options: RaftOptions,
        mut storage: Box<dyn Storage>,
        state_machine: Arc<dyn StateMachine>,
        tracker: ConsistencyTracker,
        notices: mpsc::UnboundedSender<ApplyNotice>,
        now: Instant,
    ) -> Result<Self, RaftError> {
        options.validate()?;
        let id = options.id.clone();
        let hard_state = storage.load_hard_state()?.unwrap_or_default();
        let snapshot_meta = storage.snapshot_meta()?;

        let mut store_id = state_machine.identity();
        let holds_no_data =
            state_machine.is_empty() && storage.last_index() == 0 && snapshot_meta.is_none();
        if let Some(expected) = options.cluster_store_id {
            if let Compatibility::Adopt(identity) =
                verify_compatible(store_id.as_ref(), holds_no_data, &expected)?
            {
                state_machine.initialize(identity)?;
                store_id = Some(identity);
            }
        }
        if store_id.is_none() && options.bootstrap && holds_no_data {
            let identity = StoreIdentity::generate();
            state_machine.initialize(identity)?;
            info!("Member {} bootstrapped store identity {}", id, identity);
            store_id = Some(identity);
        }

        let mut cached_snapshot = None;
        if let Some(meta) = &snapshot_meta {
            if state_machine.last_applied() < meta.last_included_index {
                let snapshot = storage.load_snapshot()?.ok_or(SnapshotError::NotFound)?;
                state_machine.restore(meta.last_included_index, meta.store_id, &snapshot.data)?;
                info!(
                    "Member {} restored local snapshot at index {}",
                    id, meta.last_included_index
                );
                store_id = Some(meta.store_id);
                cached_snapshot = Some(Arc::new(snapshot));
            }
        }

        let applied = state_machine.last_applied();
        if applied > storage.last_index() {
            let term = snapshot_meta
                .as_ref()
                .filter(|m| m.last_included_index == applied)
                .map_or(0, |m| m.last_included_term);
            warn!(
                "Member {} state machine is at {} beyond the log end {}, resetting log",
                id,
                applied,
                storage.last_index()
            );
            storage.reset(applied, term)?;
        }
        let applied_term = storage.term_at(applied)?.unwrap_or(0);

        let base = match &snapshot_meta {
            Some(meta) => meta.membership.clone(),
            None => MembershipEntry {
                index: 0,
                term: 0,
                set: options.initial_membership(),
            },
        };
        let mut membership = MembershipRegistry::new(base);
        let last = storage.last_index();
        let mut low = storage.first_index();
        while low <= last {
            let high = (low + 1024).min(last + 1);
            for entry in storage.entries(low, high)? {
                if let Some(decoded) = entry.membership_entry() {
                    let decoded = decoded.map_err(|e| StorageError::Codec(e.to_string()))?;
                    if decoded.index > membership.current_entry().index {
                        membership.append(decoded);
                    }
                }
            }
            low = high;
        }
        membership.commit(applied);
        storage.mark_committed(applied);
        storage.mark_applied(applied);

        tracker.publish(applied);
        let applier = ApplierHandle::spawn(
            id.clone(),
            state_machine.clone(),
            tracker,
            options.applier.clone(),
            (applied, applied_term),
            notices,
        )
        .map_err(StorageError::Io)?;

        info!(
            "Member {} starting at term {}, log {}..={}, applied {}, voters {:?}",
            id,
            hard_state.term,
            storage.first_index(),
            storage.last_index(),
            applied,
            membership.current_voters()
        );

        let mut state = Self {
            faults: FaultHandler::new(id.clone()),
            id,
            options,
            role: RoleState::Follower {
                leader: None,
                pre_votes: None,
            },
            current_term: hard_state.term,
            voted_for: hard_state.voted_for,
            commit_index: applied,
            applied_index: applied,
            majority_applied: 0,
            dispatched_index: applied,
            snapshot_index: snapshot_meta.map_or(0, |m| m.last_included_index),
            storage,
            membership,
            state_machine,
            applier,
            store_id,
            snapshot_in_progress: false,
            snapshots_installed: 0,
            cached_snapshot,
            receiver: None,
            pending: BTreeMap::new(),
            pending_change: None,
            election_deadline: now,
            last_leader_contact: None,
            health: Health::Healthy,
            outbox: Vec::new(),
        };
        state.reset_election_deadline(now);
        Ok(state)
    }

    pub fn step(&mut self, event: Event, now: Instant) {
        if self.faults.is_fatal() {
            self.refuse(event);
            return;
        }
        match event {
            Event::Message { from, message } => self.handle_message(from, message, now),
            Event::Propose { command, reply } => self.handle_propose(command, reply, now),
            Event::ChangeMembership { change, reply } => {
                self.handle_change_membership(change, reply, now)
            }
            Event::Applied(notice) => self.handle_apply_notice(notice, now),
            Event::TriggerSnapshot => self.request_snapshot(),
            Event::Shutdown => {}
        }
    }

    /// Drives election timeouts, heartbeats and leader lease checks.
    pub fn tick(&mut self, now: Instant) {
        if self.faults.is_fatal() {
            return;
        }
        if self.is_leader() {
            self.check_quorum(now);
        }
        let heartbeat_due = match &self.role {
            RoleState::Leader(leader) => Some(leader.heartbeat_due <= now),
            _ => None,
        };
        match heartbeat_due {
            Some(true) => {
                if let RoleState::Leader(leader) = &mut self.role {
                    leader.heartbeat_due = now + self.options.heartbeat_interval;
                }
                self.broadcast_append(now);
            }
            Some(false) => {}
            None => self.tick_election(now),
        }
    }

    fn handle_message(&mut self, from: MemberId, message: RaftMessage, now: Instant) {
        match message {
            RaftMessage::PreVoteRequest(req) => self.handle_pre_vote_request(from, req, now),
            RaftMessage::PreVoteResponse(resp) => self.handle_pre_vote_response(from, resp, now),
            RaftMessage::VoteRequest(req) => self.handle_vote_request(from, req, now),
            RaftMessage::VoteResponse(resp) => self.handle_vote_response(from, resp, now),
            RaftMessage::AppendEntriesRequest(req) => {
                self.handle_append_entries_request(from, req, now)
            }
            RaftMessage::AppendEntriesResponse(resp) => {
                self.handle_append_entries_response(from, resp, now)
            }
            RaftMessage::InstallSnapshotRequest(req) => {
                self.handle_install_snapshot_request(from, req, now)
            }
            RaftMessage::InstallSnapshotResponse(resp) => {
                self.handle_install_snapshot_response(from, resp, now)
            }
        }
    }

    fn refuse(&mut self, event: Event) {
        let reason = self.faults.fatal().unwrap_or_default().to_string();
        match event {
            Event::Propose { reply, .. } | Event::ChangeMembership { reply, .. } => {
                let _ = reply.send(Err(ClientError::Unhealthy(reason)));
            }
            _ => {}
        }
    }

    pub(crate) fn send(&mut self, to: &MemberId, message: RaftMessage) {
        self.outbox.push((to.clone(), message));
    }

    /// Messages produced since the last call.
    pub fn take_outbox(&mut self) -> Vec<(MemberId, RaftMessage)> {
        std::mem::take(&mut self.outbox)
    }

    pub fn role(&self) -> Role {
        self.role.role()
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, RoleState::Leader(_))
    }

    pub fn leader_id(&self) -> Option<MemberId> {
        match &self.role {
            RoleState::Follower { leader, .. } => leader.clone(),
            RoleState::Candidate { .. } => None,
            RoleState::Leader(_) => Some(self.id.clone()),
        }
    }

    pub fn fatal(&self) -> Option<&str> {
        self.faults.fatal()
    }

    pub(crate) fn last_log(&self) -> (u64, u64) {
        let index = self.storage.last_index();
        let term = self.storage.term_at(index).ok().flatten().unwrap_or(0);
        (index, term)
    }

    /// Saves term and vote. Returns false when they did not reach disk, in
    /// which case nothing that depends on them may be sent.
    #[must_use]
    pub(crate) fn persist_hard_state(&mut self) -> bool {
        let state = HardState {
            term: self.current_term,
            voted_for: self.voted_for.clone(),
        };
        let result = self.storage.save_hard_state(&state);
        self.faults.handle(result, "persist hard state", None).is_some()
    }

    pub(crate) fn random_election_timeout(&self) -> Duration {
        let min = self.options.election_timeout_min.as_millis() as u64;
        let max = self.options.election_timeout_max.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    pub(crate) fn reset_election_deadline(&mut self, now: Instant) {
        self.election_deadline = now + self.random_election_timeout();
    }

    /// Steps down (or stays) as follower, adopting `term` if it is newer.
    pub(crate) fn become_follower(&mut self, term: u64, leader: Option<MemberId>, now: Instant) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            // a failure is latched as fatal and the runtime drops the outbox
            let _ = self.persist_hard_state();
        }
        let was = self.role();
        if was == Role::Leader {
            self.fail_pending(ClientError::LeadershipLost);
        }
        let same = matches!(&self.role, RoleState::Follower { leader: current, .. } if *current == leader);
        if !same {
            info!(
                "Member {} became follower in term {} (was {}, leader {:?})",
                self.id, self.current_term, was, leader
            );
        }
        if was != Role::Follower {
            self.reset_election_deadline(now);
        }
        self.role = RoleState::Follower {
            leader,
            pre_votes: None,
        };
    }

    pub(crate) fn become_leader(&mut self, now: Instant) {
        info!("Member {} became leader for term {}", self.id, self.current_term);
        let next_index = self.storage.last_index() + 1;
        let progress = self
            .membership
            .current()
            .members()
            .into_iter()
            .filter(|m| *m != self.id)
            .map(|m| (m, Progress::new(next_index, now)))
            .collect();
        self.role = RoleState::Leader(LeaderState {
            progress,
            since: now,
            heartbeat_due: now + self.options.heartbeat_interval,
        });
        self.append_noop(now);
    }

    /// A leader that has not heard from a majority within the maximum
    /// election timeout steps down.
    fn check_quorum(&mut self, now: Instant) {
        let window = self.options.election_timeout_max;
        let RoleState::Leader(leader) = &self.role else {
            return;
        };
        if now.duration_since(leader.since) < window {
            return;
        }
        let mut alive: HashSet<MemberId> = leader
            .progress
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_response) < window)
            .map(|(m, _)| m.clone())
            .collect();
        alive.insert(self.id.clone());
        if !self.membership.current().has_majority(&alive) {
            warn!(
                "Member {} lost contact with a majority in term {}, stepping down",
                self.id, self.current_term
            );
            self.become_follower(self.current_term, None, now);
        }
    }

    /// Checks an identity stamped on incoming data, adopting it when the
    /// local store is blank. A mismatch is fatal.
    pub(crate) fn accept_identity(&mut self, remote: &StoreIdentity, from: &MemberId) -> bool {
        match verify_compatible(self.store_id.as_ref(), self.holds_no_data(), remote) {
            Ok(Compatibility::Matches) => true,
            Ok(Compatibility::Adopt(identity)) => {
                if let Err(e) = self.state_machine.initialize(identity) {
                    self.faults.report(&e, "adopt store identity", Some(from));
                    return false;
                }
                info!("Member {} adopted store identity {} from {}", self.id, identity, from);
                self.store_id = Some(identity);
                true
            }
            Err(e) => {
                self.faults.report(&e, "verify store identity", Some(from));
                false
            }
        }
    }

    /// True only when neither the state machine nor the durable log or
    /// snapshot carry anything a foreign identity could be stamped onto.
    fn holds_no_data(&self) -> bool {
        self.state_machine.is_empty()
            && self.storage.last_index() == 0
            && self.snapshot_index == 0
    }

    /// Answers every outstanding client request with `error`.
    pub(crate) fn fail_pending(&mut self, error: ClientError) {
        if !self.pending.is_empty() {
            debug!(
                "Member {} failing {} pending requests: {}",
                self.id,
                self.pending.len(),
                error
            );
        }
        for (_, reply) in std::mem::take(&mut self.pending) {
            let _ = reply.send(Err(error.clone()));
        }
        if let Some(change) = self.pending_change.take() {
            let _ = change.reply.send(Err(error));
        }
    }

    pub fn shutdown(&mut self) {
        self.fail_pending(ClientError::Shutdown);
    }

    pub fn addresses(&self) -> Vec<(MemberId, String)> {
        self.membership
            .current()
            .addresses
            .iter()
            .map(|(id, addr)| (id.clone(), addr.clone()))
            .collect()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id.clone(),
            role: self.role(),
            term: self.current_term,
            leader: self.leader_id(),
            commit_index: self.commit_index,
            applied_index: self.applied_index,
            majority_applied: self.majority_applied,
            first_log_index: self.storage.first_index(),
            last_log_index: self.storage.last_index(),
            snapshot_index: self.snapshot_index,
            snapshots_installed: self.snapshots_installed,
            membership: self.membership.current().clone(),
            membership_index: self.membership.current_entry().index,
            store_id: self.store_id,
            health: self.health.clone(),
            fatal: self.faults.fatal().map(str::to_string),
        }
    }
}
