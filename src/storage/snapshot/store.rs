use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::message::{Snapshot, SnapshotMeta};
use crate::traits::{SnapshotStorage, StorageResult};

const CURRENT: &str = "CURRENT";
const SNAPSHOT_PREFIX: &str = "snapshot-";
const META_FILE: &str = "meta.json";
const DATA_FILE: &str = "data.bin";

/// Hex encoded sha256 of `data`.
pub fn calculate_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
    verify_checksum: bool,
}

impl FileSnapshotStore {
    pub fn open(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let store = Self {
            dir,
            verify_checksum: true,
        };
        let current = store.current_dir_name()?;
        store.remove_stale(current.as_deref())?;
        info!("Snapshot store at {:?} (current: {:?})", store.dir, current);
        Ok(store)
    }

    pub fn with_checksum_verification(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    fn dir_name(index: u64) -> String {
        format!("{}{:020}", SNAPSHOT_PREFIX, index)
    }

    /// Name of the snapshot directory `CURRENT` points at, if any.
    fn current_dir_name(&self) -> StorageResult<Option<String>> {
        let path = self.dir.join(CURRENT);
        if !path.exists() {
            return Ok(None);
        }
        let name = fs::read_to_string(path)?.trim().to_string();
        if !name.starts_with(SNAPSHOT_PREFIX) || name.contains(['/', '\\']) {
            return Err(StorageError::Consistency(format!(
                "snapshot pointer names {:?}",
                name
            )));
        }
        Ok(Some(name))
    }

    fn current_dir(&self) -> StorageResult<Option<PathBuf>> {
        Ok(self.current_dir_name()?.map(|name| self.dir.join(name)))
    }

    /// Deletes snapshot directories and temp files other than `keep`.
    fn remove_stale(&self, keep: Option<&str>) -> StorageResult<()> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == CURRENT || Some(name.as_str()) == keep {
                continue;
            }
            let path = entry.path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match removed {
                Ok(()) => debug!("Removed stale snapshot entry {:?}", path),
                Err(e) => warn!("Failed to remove stale snapshot entry {:?}: {}", path, e),
            }
        }
        Ok(())
    }

    fn write_synced(path: &Path, bytes: &[u8]) -> StorageResult<()> {
        let mut file = File::create(path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(())
    }

    fn sync_dir(path: &Path) -> StorageResult<()> {
        File::open(path)?.sync_all()?;
        Ok(())
    }
}

impl SnapshotStorage for FileSnapshotStore {
    /// Writes the snapshot into its own directory, then swings `CURRENT` to it
    /// with a single rename. Until that rename the previous snapshot stays
    /// the visible one.
    fn save_snapshot(&mut self, snapshot: &Snapshot) -> StorageResult<()> {
        let name = Self::dir_name(snapshot.meta.last_included_index);
        let staging = self.dir.join(format!("{}.tmp", name));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;
        Self::write_synced(&staging.join(DATA_FILE), &snapshot.data)?;
        Self::write_synced(
            &staging.join(META_FILE),
            &serde_json::to_vec_pretty(&snapshot.meta)?,
        )?;
        Self::sync_dir(&staging)?;

        let target = self.dir.join(&name);
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(&staging, &target)?;
        Self::sync_dir(&self.dir)?;

        let pointer_tmp = self.dir.join(format!("{}.tmp", CURRENT));
        Self::write_synced(&pointer_tmp, name.as_bytes())?;
        fs::rename(&pointer_tmp, self.dir.join(CURRENT))?;
        Self::sync_dir(&self.dir)?;

        self.remove_stale(Some(&name))?;
        debug!(
            "Saved snapshot at index {} term {} ({} bytes)",
            snapshot.meta.last_included_index,
            snapshot.meta.last_included_term,
            snapshot.data.len()
        );
        Ok(())
    }

    fn load_snapshot(&self) -> StorageResult<Option<Snapshot>> {
        let Some(dir) = self.current_dir()? else {
            return Ok(None);
        };
        let meta: SnapshotMeta = serde_json::from_slice(&fs::read(dir.join(META_FILE))?)?;
        let data = fs::read(dir.join(DATA_FILE))?;
        if data.len() as u64 != meta.size {
            warn!(
                "Snapshot data size {} does not match meta size {}",
                data.len(),
                meta.size
            );
            return Err(StorageError::Consistency("snapshot size mismatch".into()));
        }
        if self.verify_checksum {
            let actual = calculate_checksum(&data);
            if actual != meta.checksum {
                return Err(StorageError::Consistency(format!(
                    "snapshot checksum mismatch: expected {}, got {}",
                    meta.checksum, actual
                )));
            }
        }
        Ok(Some(Snapshot { meta, data }))
    }

    fn snapshot_meta(&self) -> StorageResult<Option<SnapshotMeta>> {
        let Some(dir) = self.current_dir()? else {
            return Ok(None);
        };
        let bytes = fs::read(dir.join(META_FILE))?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}
