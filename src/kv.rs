//! In-memory key/value state machine used by the binary and the tests.

use std::collections::{BTreeMap, HashSet};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ApplyError;
use crate::identity::StoreIdentity;
use crate::message;
use crate::traits::{ApplyResult, StateMachine};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Put { key: String, value: String },
    Delete { key: String },
}

impl KvCommand {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        KvCommand::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        KvCommand::Delete { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            KvCommand::Put { key, .. } | KvCommand::Delete { key } => key,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // a plain enum of strings always serializes
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct KvState {
    data: BTreeMap<String, String>,
    /// Keys in the order their commands were applied.
    history: Vec<String>,
    last_applied: u64,
    last_tx: u64,
}

#[derive(Default)]
pub struct KvStore {
    state: RwLock<KvState>,
    identity: RwLock<Option<StoreIdentity>>,
    failing: Mutex<HashSet<String>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty store stamped with `identity`, as a member restarts when its
    /// data lives only in the replicated log and snapshot.
    pub fn with_identity(identity: StoreIdentity) -> Self {
        let store = Self::new();
        *store.identity.write() = Some(identity);
        store
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.state.read().data.get(key).cloned()
    }

    pub fn data(&self) -> BTreeMap<String, String> {
        self.state.read().data.clone()
    }

    pub fn history(&self) -> Vec<String> {
        self.state.read().history.clone()
    }

    pub fn len(&self) -> usize {
        self.state.read().data.len()
    }

    /// Makes every command on `key` fail, to exercise apply failures.
    pub fn fail_key(&self, key: &str) {
        self.failing.lock().insert(key.to_string());
    }

    pub fn heal_key(&self, key: &str) {
        self.failing.lock().remove(key);
    }
}

impl StateMachine for KvStore {
    fn apply(&self, index: u64, command: &[u8]) -> ApplyResult<u64> {
        let command =
            KvCommand::decode(command).map_err(|e| ApplyError::Malformed(index, e.to_string()))?;
        if self.failing.lock().contains(command.key()) {
            return Err(ApplyError::Internal(format!("key {} is failing", command.key())));
        }
        let mut state = self.state.write();
        match &command {
            KvCommand::Put { key, value } => {
                state.data.insert(key.clone(), value.clone());
            }
            KvCommand::Delete { key } => {
                state.data.remove(key);
            }
        }
        state.history.push(command.key().to_string());
        state.last_applied = index;
        state.last_tx += 1;
        debug!("Applied {:?} at index {} as tx {}", command, index, state.last_tx);
        Ok(state.last_tx)
    }

    fn snapshot(&self) -> ApplyResult<Vec<u8>> {
        let state = self.state.read();
        message::encode(&*state).map_err(|e| ApplyError::Internal(e.to_string()))
    }

    fn restore(&self, index: u64, identity: StoreIdentity, data: &[u8]) -> ApplyResult<()> {
        let mut restored: KvState =
            message::decode(data).map_err(|e| ApplyError::BadSnapshot(e.to_string()))?;
        restored.last_applied = index;
        *self.state.write() = restored;
        *self.identity.write() = Some(identity);
        Ok(())
    }

    fn identity(&self) -> Option<StoreIdentity> {
        *self.identity.read()
    }

    fn initialize(&self, identity: StoreIdentity) -> ApplyResult<()> {
        *self.identity.write() = Some(identity);
        Ok(())
    }

    fn is_empty(&self) -> bool {
        let state = self.state.read();
        state.data.is_empty() && state.last_applied == 0
    }

    fn last_applied(&self) -> u64 {
        self.state.read().last_applied
    }
}
