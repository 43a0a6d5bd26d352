//! Durable `Storage` implementation combining the segmented log, the hard
//! state file and the snapshot store under one data directory:
//!
//! ```text
//! {base_dir}/
//! ├── hard_state.json
//! ├── log/segment-0000000001.log ...
//! └── snapshot/{CURRENT,snapshot-{index}/}
//! ```

use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use tracing::info;

use crate::message::{HardState, LogEntry, Snapshot, SnapshotMeta};
use crate::traits::{HardStateStorage, LogStorage, SnapshotStorage, StorageResult};

use super::log::{SegmentedLog, SegmentedLogOptions};
use super::snapshot::FileSnapshotStore;

#[derive(Debug, Clone)]
pub struct FileStorageOptions {
    pub base_dir: PathBuf,
    /// Maximum log segment size in bytes before rotation.
    pub max_segment_size: u64,
    /// Whether to fsync after each log write.
    pub sync_on_write: bool,
    pub verify_snapshot_checksum: bool,
}

impl FileStorageOptions {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_segment_size: 16 * 1024 * 1024,
            sync_on_write: true,
            verify_snapshot_checksum: true,
        }
    }
}

pub struct FileStorage {
    hard_state_path: PathBuf,
    log: SegmentedLog,
    snapshots: FileSnapshotStore,
}

impl FileStorage {
    pub fn open(options: FileStorageOptions) -> StorageResult<Self> {
        fs::create_dir_all(&options.base_dir)?;
        let log = SegmentedLog::open(SegmentedLogOptions {
            dir: options.base_dir.join("log"),
            max_segment_size: options.max_segment_size,
            sync_on_write: options.sync_on_write,
        })?;
        let snapshots = FileSnapshotStore::open(options.base_dir.join("snapshot"))?
            .with_checksum_verification(options.verify_snapshot_checksum);
        info!("File storage opened at {:?}", options.base_dir);
        Ok(Self {
            hard_state_path: options.base_dir.join("hard_state.json"),
            log,
            snapshots,
        })
    }
}

impl HardStateStorage for FileStorage {
    fn save_hard_state(&mut self, state: &HardState) -> StorageResult<()> {
        let bytes = serde_json::to_vec(state)?;
        let tmp = self.hard_state_path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.hard_state_path)?;
        Ok(())
    }

    fn load_hard_state(&self) -> StorageResult<Option<HardState>> {
        if !self.hard_state_path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.hard_state_path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

impl LogStorage for FileStorage {
    fn append(&mut self, entries: &[LogEntry]) -> StorageResult<u64> {
        self.log.append(entries)
    }

    fn entry(&self, index: u64) -> StorageResult<Option<LogEntry>> {
        self.log.entry(index)
    }

    fn entries(&self, low: u64, high: u64) -> StorageResult<Vec<LogEntry>> {
        self.log.entries(low, high)
    }

    fn truncate_after(&mut self, index: u64) -> StorageResult<()> {
        self.log.truncate_after(index)
    }

    fn prune_before(&mut self, index: u64) -> StorageResult<u64> {
        self.log.prune_before(index)
    }

    fn reset(&mut self, prev_index: u64, prev_term: u64) -> StorageResult<()> {
        self.log.reset(prev_index, prev_term)
    }

    fn first_index(&self) -> u64 {
        self.log.first_index()
    }

    fn last_index(&self) -> u64 {
        self.log.last_index()
    }

    fn prev_index(&self) -> u64 {
        self.log.prev_index()
    }

    fn prev_term(&self) -> u64 {
        self.log.prev_term()
    }

    fn term_at(&self, index: u64) -> StorageResult<Option<u64>> {
        self.log.term_at(index)
    }

    fn mark_committed(&mut self, index: u64) {
        self.log.mark_committed(index)
    }

    fn mark_applied(&mut self, index: u64) {
        self.log.mark_applied(index)
    }

    fn mark_majority_applied(&mut self, index: u64) {
        self.log.mark_majority_applied(index)
    }
}

impl SnapshotStorage for FileStorage {
    fn save_snapshot(&mut self, snapshot: &Snapshot) -> StorageResult<()> {
        self.snapshots.save_snapshot(snapshot)
    }

    fn load_snapshot(&self) -> StorageResult<Option<Snapshot>> {
        self.snapshots.load_snapshot()
    }

    fn snapshot_meta(&self) -> StorageResult<Option<SnapshotMeta>> {
        self.snapshots.snapshot_meta()
    }
}
