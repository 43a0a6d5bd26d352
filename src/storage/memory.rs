use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::StorageError;
use crate::message::{HardState, LogEntry, Snapshot, SnapshotMeta};
use crate::storage::LogWatermarks;
use crate::traits::{HardStateStorage, LogStorage, SnapshotStorage, StorageResult};

#[derive(Default)]
struct Inner {
    hard_state: Option<HardState>,
    entries: VecDeque<LogEntry>,
    prev_index: u64,
    prev_term: u64,
    snapshot: Option<Snapshot>,
    watermarks: LogWatermarks,
    hard_state_fails: bool,
}

/// Volatile storage. Clones share the same state, so a member can be
/// restarted over what it persisted before.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following `save_hard_state` fail with an I/O error.
    pub fn fail_hard_state_writes(&self, fail: bool) {
        self.inner.lock().hard_state_fails = fail;
    }
}

impl HardStateStorage for MemoryStorage {
    fn save_hard_state(&mut self, state: &HardState) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if inner.hard_state_fails {
            return Err(StorageError::Io(std::io::Error::other("hard state write failed")));
        }
        inner.hard_state = Some(state.clone());
        Ok(())
    }

    fn load_hard_state(&self) -> StorageResult<Option<HardState>> {
        Ok(self.inner.lock().hard_state.clone())
    }
}

impl Inner {
    fn last_index(&self) -> u64 {
        self.entries.back().map(|e| e.index).unwrap_or(self.prev_index)
    }

    fn get(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.prev_index {
            return None;
        }
        self.entries.get((index - self.prev_index - 1) as usize)
    }
}

impl LogStorage for MemoryStorage {
    fn append(&mut self, entries: &[LogEntry]) -> StorageResult<u64> {
        let mut inner = self.inner.lock();
        for entry in entries {
            let expected = inner.last_index() + 1;
            if entry.index != expected {
                return Err(StorageError::NonContiguous {
                    expected,
                    got: entry.index,
                });
            }
            inner.entries.push_back(entry.clone());
        }
        Ok(inner.last_index())
    }

    fn entry(&self, index: u64) -> StorageResult<Option<LogEntry>> {
        Ok(self.inner.lock().get(index).cloned())
    }

    fn entries(&self, low: u64, high: u64) -> StorageResult<Vec<LogEntry>> {
        let inner = self.inner.lock();
        if low <= inner.prev_index {
            return Err(StorageError::Compacted {
                index: low,
                first: inner.prev_index + 1,
            });
        }
        let high = high.min(inner.last_index() + 1);
        Ok((low..high).filter_map(|i| inner.get(i).cloned()).collect())
    }

    fn truncate_after(&mut self, index: u64) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        inner.watermarks.check_truncate(index)?;
        while inner.entries.back().is_some_and(|e| e.index > index) {
            inner.entries.pop_back();
        }
        Ok(())
    }

    fn prune_before(&mut self, index: u64) -> StorageResult<u64> {
        let mut inner = self.inner.lock();
        inner.watermarks.check_prune(index)?;
        let index = index.min(inner.last_index() + 1);
        if index <= inner.prev_index + 1 {
            return Ok(inner.prev_index + 1);
        }
        let prev_term = inner
            .get(index - 1)
            .map(|e| e.term)
            .ok_or(StorageError::LogNotFound(index - 1))?;
        while inner.entries.front().is_some_and(|e| e.index < index) {
            inner.entries.pop_front();
        }
        inner.prev_index = index - 1;
        inner.prev_term = prev_term;
        Ok(index)
    }

    fn reset(&mut self, prev_index: u64, prev_term: u64) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.prev_index = prev_index;
        inner.prev_term = prev_term;
        inner.watermarks.reset(prev_index);
        Ok(())
    }

    fn first_index(&self) -> u64 {
        self.inner.lock().prev_index + 1
    }

    fn last_index(&self) -> u64 {
        self.inner.lock().last_index()
    }

    fn prev_index(&self) -> u64 {
        self.inner.lock().prev_index
    }

    fn prev_term(&self) -> u64 {
        self.inner.lock().prev_term
    }

    fn term_at(&self, index: u64) -> StorageResult<Option<u64>> {
        let inner = self.inner.lock();
        if index == 0 {
            return Ok(Some(0));
        }
        if index == inner.prev_index {
            return Ok(Some(inner.prev_term));
        }
        Ok(inner.get(index).map(|e| e.term))
    }

    fn mark_committed(&mut self, index: u64) {
        self.inner.lock().watermarks.mark_committed(index);
    }

    fn mark_applied(&mut self, index: u64) {
        self.inner.lock().watermarks.mark_applied(index);
    }

    fn mark_majority_applied(&mut self, index: u64) {
        self.inner.lock().watermarks.mark_majority_applied(index);
    }
}

impl SnapshotStorage for MemoryStorage {
    fn save_snapshot(&mut self, snapshot: &Snapshot) -> StorageResult<()> {
        self.inner.lock().snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn load_snapshot(&self) -> StorageResult<Option<Snapshot>> {
        Ok(self.inner.lock().snapshot.clone())
    }

    fn snapshot_meta(&self) -> StorageResult<Option<SnapshotMeta>> {
        Ok(self.inner.lock().snapshot.as_ref().map(|s| s.meta.clone()))
    }
}
