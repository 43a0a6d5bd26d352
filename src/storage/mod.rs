pub mod file_storage;
pub mod log;
pub mod memory;
pub mod snapshot;

pub use file_storage::{FileStorage, FileStorageOptions};
pub use log::{SegmentedLog, SegmentedLogOptions};
pub use memory::MemoryStorage;
pub use snapshot::FileSnapshotStore;

use crate::error::StorageError;
use crate::traits::StorageResult;

/// Commit and apply watermarks that guard destructive log operations.
///
/// `majority_applied` is the highest index a majority of voters reported as
/// applied. Pruning stops at the lower of it and the local applied index.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogWatermarks {
    pub committed: u64,
    pub applied: u64,
    pub majority_applied: u64,
}

impl LogWatermarks {
    pub fn check_truncate(&self, index: u64) -> StorageResult<()> {
        if index < self.committed {
            return Err(StorageError::IllegalTruncate {
                index,
                committed: self.committed,
            });
        }
        Ok(())
    }

    pub fn check_prune(&self, index: u64) -> StorageResult<()> {
        let applied = self.prunable();
        if index > applied + 1 {
            return Err(StorageError::UnsafePrune { index, applied });
        }
        Ok(())
    }

    /// Highest index that is applied both locally and on a majority.
    pub fn prunable(&self) -> u64 {
        self.applied.min(self.majority_applied)
    }

    pub fn mark_committed(&mut self, index: u64) {
        self.committed = self.committed.max(index);
    }

    pub fn mark_applied(&mut self, index: u64) {
        self.applied = self.applied.max(index);
    }

    pub fn mark_majority_applied(&mut self, index: u64) {
        self.majority_applied = self.majority_applied.max(index);
    }

    /// After a snapshot install the watermarks jump to the snapshot index;
    /// nothing at or below it is left in the log.
    pub fn reset(&mut self, index: u64) {
        self.committed = index;
        self.applied = index;
        self.majority_applied = self.majority_applied.max(index);
    }
}
