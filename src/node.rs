//! Runtime around `RaftState` and the public member API.
//!
//! One tokio task owns the state and multiplexes transport messages, client
//! requests, applier notices and the tick timer. After each input the outbox
//! is flushed through the `Network` and a fresh `NodeStatus` is published.

use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::applier::ApplyNotice;
use crate::config::RaftOptions;
use crate::consistency::ConsistencyTracker;
use crate::error::{ClientError, FaultHandler, RaftError};
use crate::event::{ClientResult, Event, Role};
use crate::membership::MembershipChange;
use crate::message::RaftMessage;
use crate::state::{NodeStatus, RaftState};
use crate::traits::{Network, StateMachine, Storage};
use crate::types::{Command, MemberId};

/// Delivery endpoint handed to transports.
#[derive(Clone)]
pub struct Inbox {
    member: MemberId,
    tx: mpsc::UnboundedSender<Event>,
}

impl Inbox {
    #[cfg(test)]
    pub(crate) fn for_test(member: MemberId, tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { member, tx }
    }

    pub fn member(&self) -> &MemberId {
        &self.member
    }

    /// Returns false once the member has stopped.
    pub fn deliver(&self, from: MemberId, message: RaftMessage) -> bool {
        self.tx.send(Event::Message { from, message }).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberRole {
    Leader,
    Follower,
    Candidate,
    ReadReplica,
}

impl Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberRole::Leader => write!(f, "Leader"),
            MemberRole::Follower => write!(f, "Follower"),
            MemberRole::Candidate => write!(f, "Candidate"),
            MemberRole::ReadReplica => write!(f, "ReadReplica"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub id: MemberId,
    pub address: String,
    pub role: MemberRole,
}

pub struct RaftNode {
    id: MemberId,
    events: mpsc::UnboundedSender<Event>,
    status: watch::Receiver<NodeStatus>,
    tracker: ConsistencyTracker,
    client_timeout: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RaftNode {
    /// Loads persisted state and starts the member. Must be called within a
    /// tokio runtime.
    pub fn start(
        options: RaftOptions,
        storage: Box<dyn Storage>,
        state_machine: Arc<dyn StateMachine>,
        network: Arc<dyn Network>,
    ) -> Result<Self, RaftError> {
        let id = options.id.clone();
        let tick_interval = options.tick_interval;
        let client_timeout = options.client_timeout;
        let tracker = ConsistencyTracker::new(state_machine.last_applied());
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let state = RaftState::new(
            options,
            storage,
            state_machine,
            tracker.clone(),
            notice_tx,
            Instant::now(),
        )?;

        let (events, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(state.status());
        for (member, address) in state.addresses() {
            network.register_address(&member, &address);
        }
        let runtime = NodeRuntime {
            id: id.clone(),
            state,
            network,
            status: status_tx,
            membership_index: None,
            faults: FaultHandler::new(id.clone()),
        };
        let task = tokio::spawn(runtime.run(event_rx, notices, tick_interval));
        info!("Member {} started", id);

        Ok(Self {
            id,
            events,
            status,
            tracker,
            client_timeout,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn id(&self) -> &MemberId {
        &self.id
    }

    pub fn inbox(&self) -> Inbox {
        Inbox {
            member: self.id.clone(),
            tx: self.events.clone(),
        }
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<ClientResult<u64>>) -> Event,
    ) -> ClientResult<u64> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(make(tx))
            .map_err(|_| ClientError::Shutdown)?;
        match tokio::time::timeout(self.client_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Shutdown),
            Err(_) => Err(ClientError::RequestTimeout),
        }
    }

    /// Replicates `command` and resolves with its log index once it is
    /// applied on this member.
    pub async fn submit(&self, command: Command) -> ClientResult<u64> {
        self.request(|reply| Event::Propose { command, reply }).await
    }

    /// Resolves once this member has applied `index`.
    pub async fn await_applied_at_least(&self, index: u64, timeout: Duration) -> ClientResult<u64> {
        self.tracker.await_applied_at_least(index, timeout).await
    }

    pub fn current_role(&self) -> Role {
        self.status.borrow().role
    }

    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every published status.
    pub fn status_changes(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }

    pub fn tracker(&self) -> &ConsistencyTracker {
        &self.tracker
    }

    /// Members as seen from here, with their roles.
    pub fn cluster_overview(&self) -> Vec<ClusterMember> {
        let status = self.status.borrow();
        status
            .membership
            .members()
            .into_iter()
            .map(|member| {
                let role = if status.membership.is_learner(&member) {
                    MemberRole::ReadReplica
                } else if status.leader.as_ref() == Some(&member) {
                    MemberRole::Leader
                } else if member == self.id && status.role == Role::Candidate {
                    MemberRole::Candidate
                } else {
                    MemberRole::Follower
                };
                ClusterMember {
                    address: status
                        .membership
                        .address_of(&member)
                        .unwrap_or_default()
                        .to_string(),
                    id: member,
                    role,
                }
            })
            .collect()
    }

    async fn change(&self, change: MembershipChange) -> ClientResult<u64> {
        self.request(|reply| Event::ChangeMembership { change, reply })
            .await
    }

    pub async fn add_member(&self, id: MemberId, address: String) -> ClientResult<u64> {
        self.change(MembershipChange::AddVoter { id, address }).await
    }

    pub async fn remove_member(&self, id: MemberId) -> ClientResult<u64> {
        self.change(MembershipChange::RemoveVoter { id }).await
    }

    pub async fn add_read_replica(&self, id: MemberId, address: String) -> ClientResult<u64> {
        self.change(MembershipChange::AddLearner { id, address }).await
    }

    pub async fn remove_read_replica(&self, id: MemberId) -> ClientResult<u64> {
        self.change(MembershipChange::RemoveLearner { id }).await
    }

    /// Captures a snapshot now instead of waiting for the threshold.
    pub fn trigger_snapshot(&self) -> ClientResult<()> {
        self.events
            .send(Event::TriggerSnapshot)
            .map_err(|_| ClientError::Shutdown)
    }

    /// Stops the member and waits for its task to finish.
    pub async fn shutdown(&self) {
        let _ = self.events.send(Event::Shutdown);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for RaftNode {
    fn drop(&mut self) {
        let _ = self.events.send(Event::Shutdown);
    }
}

struct NodeRuntime {
    id: MemberId,
    state: RaftState,
    network: Arc<dyn Network>,
    status: watch::Sender<NodeStatus>,
    membership_index: Option<u64>,
    faults: FaultHandler,
}

impl NodeRuntime {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<Event>,
        mut notices: mpsc::UnboundedReceiver<ApplyNotice>,
        tick_interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(Event::Shutdown) | None => break,
                    Some(event) => self.state.step(event, Instant::now()),
                },
                Some(notice) = notices.recv() => {
                    self.state.step(Event::Applied(notice), Instant::now());
                }
                _ = ticker.tick() => self.state.tick(Instant::now()),
            }
            self.flush().await;
            if let Some(reason) = self.state.fatal() {
                error!("Member {} stopped after fatal error: {}", self.id, reason);
                break;
            }
        }
        self.state.shutdown();
        self.status.send_replace(self.state.status());
        info!("Member {} stopped", self.id);
    }

    async fn flush(&mut self) {
        let status = self.state.status();
        if self.membership_index != Some(status.membership_index) {
            for (member, address) in self.state.addresses() {
                self.network.register_address(&member, &address);
            }
            self.membership_index = Some(status.membership_index);
        }
        let outbox = self.state.take_outbox();
        if let Some(reason) = self.state.fatal() {
            // replies may rest on state that never reached disk
            if !outbox.is_empty() {
                warn!(
                    "Member {} dropping {} outgoing messages after fatal error: {}",
                    self.id,
                    outbox.len(),
                    reason
                );
            }
        } else {
            for (to, message) in outbox {
                let result = self.network.send(&self.id, &to, message).await;
                self.faults.handle(result, "send message", Some(&to));
            }
        }
        self.status.send_replace(status);
    }
}
