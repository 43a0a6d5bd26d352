use tempfile::TempDir;

use crate::identity::StoreIdentity;
use crate::membership::{MembershipEntry, MembershipSet};
use crate::message::{Snapshot, SnapshotMeta};
use crate::storage::snapshot::{FileSnapshotStore, calculate_checksum};
use crate::traits::SnapshotStorage;
use crate::types::MemberId;

fn snapshot(index: u64, data: &[u8]) -> Snapshot {
    Snapshot {
        meta: SnapshotMeta {
            last_included_index: index,
            last_included_term: 2,
            membership: MembershipEntry {
                index: 1,
                term: 1,
                set: MembershipSet::new([(MemberId::new("a"), "127.0.0.1:7000".to_string())]),
            },
            store_id: StoreIdentity::new(10, 20),
            size: data.len() as u64,
            checksum: calculate_checksum(data),
        },
        data: data.to_vec(),
    }
}

#[test]
fn test_empty_store_has_no_snapshot() {
    let dir = TempDir::new().unwrap();
    let store = FileSnapshotStore::open(dir.path()).unwrap();
    assert!(store.load_snapshot().unwrap().is_none());
    assert!(store.snapshot_meta().unwrap().is_none());
}

#[test]
fn test_save_replaces_previous_snapshot() {
    let dir = TempDir::new().unwrap();
    let mut store = FileSnapshotStore::open(dir.path()).unwrap();
    store.save_snapshot(&snapshot(10, b"first")).unwrap();
    store.save_snapshot(&snapshot(25, b"second image")).unwrap();

    let reopened = FileSnapshotStore::open(dir.path()).unwrap();
    let loaded = reopened.load_snapshot().unwrap().unwrap();
    assert_eq!(loaded, snapshot(25, b"second image"));
    assert!(!dir.path().join(snapshot_dir(10)).exists());
    assert!(!dir.path().join(format!("{}.tmp", snapshot_dir(25))).exists());
}

fn snapshot_dir(index: u64) -> String {
    format!("snapshot-{:020}", index)
}

#[test]
fn test_interrupted_save_keeps_previous_snapshot() {
    let dir = TempDir::new().unwrap();
    let mut store = FileSnapshotStore::open(dir.path()).unwrap();
    store.save_snapshot(&snapshot(10, b"first")).unwrap();

    // a save that died before publishing: staged data only
    let staging = dir.path().join(format!("{}.tmp", snapshot_dir(25)));
    std::fs::create_dir_all(&staging).unwrap();
    std::fs::write(staging.join("data.bin"), b"second image").unwrap();
    assert_eq!(store.load_snapshot().unwrap().unwrap(), snapshot(10, b"first"));

    // a save that died after moving its directory but before swapping CURRENT
    let moved = dir.path().join(snapshot_dir(25));
    std::fs::rename(&staging, &moved).unwrap();
    std::fs::write(moved.join("meta.json"), b"{ truncated").unwrap();
    assert_eq!(store.load_snapshot().unwrap().unwrap(), snapshot(10, b"first"));

    let reopened = FileSnapshotStore::open(dir.path()).unwrap();
    assert_eq!(reopened.snapshot_meta().unwrap().unwrap().last_included_index, 10);
    assert_eq!(reopened.load_snapshot().unwrap().unwrap(), snapshot(10, b"first"));
    assert!(!moved.exists());
}

#[test]
fn test_corrupted_data_is_detected() {
    let dir = TempDir::new().unwrap();
    let mut store = FileSnapshotStore::open(dir.path()).unwrap();
    store.save_snapshot(&snapshot(10, b"abcdef")).unwrap();
    std::fs::write(dir.path().join(snapshot_dir(10)).join("data.bin"), b"abcdeX").unwrap();
    assert!(store.load_snapshot().is_err());

    let lenient = store.clone().with_checksum_verification(false);
    assert_eq!(lenient.load_snapshot().unwrap().unwrap().data, b"abcdeX");
}

#[test]
fn test_checksum_is_sha256_hex() {
    assert_eq!(
        calculate_checksum(b""),
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
}
