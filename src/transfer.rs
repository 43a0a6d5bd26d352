//! Chunked snapshot streaming between leader and follower.
//!
//! The leader keeps one `OutgoingSnapshot` per lagging follower. The follower
//! stages chunks in a `SnapshotReceiver` and always answers with the offset it
//! expects next, so a lost chunk is resent from the follower's position
//! instead of restarting the whole transfer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::SnapshotError;
use crate::message::{InstallSnapshotRequest, Snapshot, SnapshotMeta};
use crate::storage::snapshot::calculate_checksum;
use crate::types::MemberId;

#[derive(Debug, Clone)]
pub struct OutgoingSnapshot {
    snapshot: Arc<Snapshot>,
    offset: u64,
    last_sent: Option<Instant>,
}

impl OutgoingSnapshot {
    pub fn new(snapshot: Arc<Snapshot>) -> Self {
        Self {
            snapshot,
            offset: 0,
            last_sent: None,
        }
    }

    pub fn index(&self) -> u64 {
        self.snapshot.meta.last_included_index
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn next_request(
        &mut self,
        term: u64,
        leader: &MemberId,
        chunk_size: usize,
        now: Instant,
    ) -> InstallSnapshotRequest {
        let len = self.snapshot.data.len();
        let start = (self.offset as usize).min(len);
        let end = (start + chunk_size).min(len);
        self.last_sent = Some(now);
        InstallSnapshotRequest {
            term,
            leader: leader.clone(),
            meta: self.snapshot.meta.clone(),
            offset: start as u64,
            data: self.snapshot.data[start..end].to_vec(),
            done: end == len,
        }
    }

    /// Moves to the offset the follower asked for.
    pub fn ack(&mut self, next_offset: u64) {
        self.offset = next_offset.min(self.snapshot.data.len() as u64);
        self.last_sent = None;
    }

    /// True when nothing is in flight or the last chunk went unanswered for
    /// longer than `interval`.
    pub fn should_send(&self, now: Instant, interval: Duration) -> bool {
        match self.last_sent {
            None => true,
            Some(sent) => now.duration_since(sent) >= interval,
        }
    }
}

#[derive(Debug)]
pub enum ChunkOutcome {
    /// Waiting for the chunk at this offset.
    Expecting(u64),
    Complete(Snapshot),
    Corrupt(SnapshotError),
}

/// Follower side staging buffer for one snapshot.
#[derive(Debug)]
pub struct SnapshotReceiver {
    meta: SnapshotMeta,
    buffer: Vec<u8>,
}

impl SnapshotReceiver {
    /// `chunk_size` bounds the up-front allocation; `meta.size` comes from the
    /// wire and is only trusted once the bytes have arrived.
    pub fn new(meta: SnapshotMeta, chunk_size: usize) -> Self {
        let capacity = usize::try_from(meta.size).unwrap_or(usize::MAX).min(chunk_size);
        Self {
            buffer: Vec::with_capacity(capacity),
            meta,
        }
    }

    pub fn is_for(&self, meta: &SnapshotMeta) -> bool {
        self.meta.last_included_index == meta.last_included_index
            && self.meta.last_included_term == meta.last_included_term
            && self.meta.checksum == meta.checksum
    }

    pub fn received(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn accept(&mut self, offset: u64, data: &[u8], done: bool) -> ChunkOutcome {
        if offset != self.received() {
            return ChunkOutcome::Expecting(self.received());
        }
        self.buffer.extend_from_slice(data);
        if self.received() > self.meta.size {
            return ChunkOutcome::Corrupt(SnapshotError::SizeMismatch {
                expected: self.meta.size,
                actual: self.received(),
            });
        }
        if !done {
            return ChunkOutcome::Expecting(self.received());
        }
        if self.received() != self.meta.size {
            return ChunkOutcome::Corrupt(SnapshotError::SizeMismatch {
                expected: self.meta.size,
                actual: self.received(),
            });
        }
        let actual = calculate_checksum(&self.buffer);
        if actual != self.meta.checksum {
            return ChunkOutcome::Corrupt(SnapshotError::Checksum {
                expected: self.meta.checksum.clone(),
                actual,
            });
        }
        ChunkOutcome::Complete(Snapshot {
            meta: self.meta.clone(),
            data: std::mem::take(&mut self.buffer),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StoreIdentity;
    use crate::membership::MembershipEntry;

    fn snapshot(data: &[u8]) -> Arc<Snapshot> {
        Arc::new(Snapshot {
            meta: SnapshotMeta {
                last_included_index: 30,
                last_included_term: 2,
                membership: MembershipEntry::default(),
                store_id: StoreIdentity::new(1, 1),
                size: data.len() as u64,
                checksum: calculate_checksum(data),
            },
            data: data.to_vec(),
        })
    }

    #[test]
    fn transfer_resumes_after_lost_chunk() {
        let snap = snapshot(b"0123456789abcdef");
        let leader = MemberId::new("leader");
        let now = Instant::now();
        let mut out = OutgoingSnapshot::new(snap.clone());
        let mut rx = SnapshotReceiver::new(snap.meta.clone(), 1024);

        let first = out.next_request(1, &leader, 6, now);
        assert!(!first.done);
        let ChunkOutcome::Expecting(next) = rx.accept(first.offset, &first.data, first.done) else {
            panic!("first chunk rejected");
        };
        out.ack(next);

        // second chunk is lost; the leader retries after the interval
        let _lost = out.next_request(1, &leader, 6, now);
        assert!(!out.should_send(now, Duration::from_millis(100)));
        assert!(out.should_send(now + Duration::from_millis(100), Duration::from_millis(100)));

        // a stale duplicate of the first chunk gets the expected offset back
        assert!(matches!(rx.accept(0, &first.data, false), ChunkOutcome::Expecting(6)));

        let mut outcome = ChunkOutcome::Expecting(6);
        while let ChunkOutcome::Expecting(next) = outcome {
            out.ack(next);
            let req = out.next_request(1, &leader, 6, now);
            outcome = rx.accept(req.offset, &req.data, req.done);
        }
        match outcome {
            ChunkOutcome::Complete(done) => assert_eq!(done.data, snap.data),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn checksum_mismatch_is_reported() {
        let snap = snapshot(b"abc");
        let mut meta = snap.meta.clone();
        meta.checksum = calculate_checksum(b"xyz");
        let mut rx = SnapshotReceiver::new(meta, 1024);
        assert!(matches!(
            rx.accept(0, b"abc", true),
            ChunkOutcome::Corrupt(SnapshotError::Checksum { .. })
        ));
    }

    #[test]
    fn empty_snapshot_completes_in_one_chunk() {
        let snap = snapshot(b"");
        let mut out = OutgoingSnapshot::new(snap.clone());
        let req = out.next_request(1, &MemberId::new("l"), 1024, Instant::now());
        assert!(req.done);
        let mut rx = SnapshotReceiver::new(snap.meta.clone(), 1024);
        assert!(matches!(rx.accept(0, &req.data, true), ChunkOutcome::Complete(_)));
    }

    #[test]
    fn oversized_meta_does_not_preallocate() {
        let snap = snapshot(b"abc");
        let mut meta = snap.meta.clone();
        meta.size = u64::MAX;
        let mut rx = SnapshotReceiver::new(meta, 16);
        assert!(rx.buffer.capacity() <= 16);
        assert!(matches!(
            rx.accept(0, b"abc", true),
            ChunkOutcome::Corrupt(SnapshotError::SizeMismatch { .. })
        ));
    }
}
