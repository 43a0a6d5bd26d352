use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use tracing::trace;

use crate::error::RpcError;
use crate::message::RaftMessage;
use crate::node::Inbox;
use crate::traits::{Network, RpcResult};
use crate::types::MemberId;

/// Simulated link behaviour.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetworkConfig {
    pub base_latency: Duration,
    /// Upper bound of extra random delay per message.
    pub jitter: Duration,
    /// Probability in `[0, 1]` that a message is silently lost.
    pub drop_rate: f64,
}

#[derive(Default)]
struct Hub {
    inboxes: RwLock<HashMap<MemberId, Inbox>>,
    isolated: RwLock<HashSet<MemberId>>,
    /// Directed links `(from, to)` that drop everything.
    blocked: RwLock<HashSet<(MemberId, MemberId)>>,
    config: RwLock<MemoryNetworkConfig>,
}

/// In-process network connecting members of one test cluster.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Hub>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MemoryNetworkConfig) -> Self {
        let network = Self::default();
        *network.hub.config.write() = config;
        network
    }

    pub fn register(&self, inbox: Inbox) {
        self.hub.inboxes.write().insert(inbox.member().clone(), inbox);
    }

    pub fn unregister(&self, member: &MemberId) {
        self.hub.inboxes.write().remove(member);
    }

    /// Cuts `member` off from everyone in both directions.
    pub fn isolate(&self, member: &MemberId) {
        self.hub.isolated.write().insert(member.clone());
    }

    pub fn restore(&self, member: &MemberId) {
        self.hub.isolated.write().remove(member);
    }

    pub fn block(&self, from: &MemberId, to: &MemberId) {
        self.hub.blocked.write().insert((from.clone(), to.clone()));
    }

    pub fn unblock(&self, from: &MemberId, to: &MemberId) {
        self.hub.blocked.write().remove(&(from.clone(), to.clone()));
    }

    /// Removes every isolation and blocked link.
    pub fn heal(&self) {
        self.hub.isolated.write().clear();
        self.hub.blocked.write().clear();
    }

    pub fn set_config(&self, config: MemoryNetworkConfig) {
        *self.hub.config.write() = config;
    }

    fn link_up(&self, from: &MemberId, to: &MemberId) -> bool {
        let isolated = self.hub.isolated.read();
        if isolated.contains(from) || isolated.contains(to) {
            return false;
        }
        !self.hub.blocked.read().contains(&(from.clone(), to.clone()))
    }

    fn delay(&self) -> Option<Duration> {
        let config = self.hub.config.read();
        let mut rng = rand::rng();
        if config.drop_rate > 0.0 && rng.random_bool(config.drop_rate.min(1.0)) {
            return None;
        }
        let jitter = config.jitter.as_millis() as u64;
        let extra = if jitter > 0 {
            Duration::from_millis(rng.random_range(0..=jitter))
        } else {
            Duration::ZERO
        };
        Some(config.base_latency + extra)
    }
}

#[async_trait]
impl Network for MemoryNetwork {
    async fn send(&self, from: &MemberId, target: &MemberId, message: RaftMessage) -> RpcResult<()> {
        if !self.link_up(from, target) {
            trace!("Dropping {} from {} to {}: link down", message.name(), from, target);
            return Err(RpcError::Unreachable(target.clone()));
        }
        let inbox = self
            .hub
            .inboxes
            .read()
            .get(target)
            .cloned()
            .ok_or_else(|| RpcError::Unreachable(target.clone()))?;
        let Some(delay) = self.delay() else {
            trace!("Dropping {} from {} to {}: lost", message.name(), from, target);
            return Ok(());
        };
        if delay.is_zero() {
            inbox.deliver(from.clone(), message);
            return Ok(());
        }
        let from = from.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inbox.deliver(from, message);
        });
        Ok(())
    }
}
