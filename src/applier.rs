//! Sequential state machine applier.
//!
//! Committed entries are handed over in batches and applied on a dedicated
//! thread, strictly in log order and exactly once. The applier is the only
//! caller of the `StateMachine`, so snapshots it captures are consistent with
//! the index it reports.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::consistency::ConsistencyTracker;
use crate::error::{ApplyError, ErrorHandler, ErrorSeverity};
use crate::message::{EntryKind, LogEntry, Snapshot};
use crate::traits::{ApplyResult, StateMachine};
use crate::types::MemberId;

#[derive(Debug)]
pub enum ApplyTask {
    Apply(Vec<LogEntry>),
    Restore(Snapshot),
    TakeSnapshot,
}

#[derive(Debug)]
pub enum ApplyNotice {
    Applied {
        index: u64,
        /// `(log index, transaction id)` of each applied client command.
        outcomes: Vec<(u64, u64)>,
    },
    Failed {
        index: u64,
        error: ApplyError,
    },
    Restored {
        index: u64,
    },
    SnapshotTaken {
        index: u64,
        term: u64,
        data: Vec<u8>,
    },
    SnapshotFailed(ApplyError),
}

#[derive(Debug, Clone)]
pub struct ApplierOptions {
    pub retry_limit: u32,
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
}

impl Default for ApplierOptions {
    fn default() -> Self {
        Self {
            retry_limit: 5,
            retry_backoff: Duration::from_millis(10),
            max_retry_backoff: Duration::from_secs(1),
        }
    }
}

struct Applier {
    member: MemberId,
    state_machine: Arc<dyn StateMachine>,
    tracker: ConsistencyTracker,
    options: ApplierOptions,
    notices: mpsc::UnboundedSender<ApplyNotice>,
    last_applied: u64,
    last_term: u64,
    healthy: bool,
}

/// Owning side of the applier thread; dropping it stops the thread once the
/// queued tasks are drained.
pub struct ApplierHandle {
    tasks: mpsc::UnboundedSender<ApplyTask>,
}

impl ApplierHandle {
    pub fn spawn(
        member: MemberId,
        state_machine: Arc<dyn StateMachine>,
        tracker: ConsistencyTracker,
        options: ApplierOptions,
        last_applied: (u64, u64),
        notices: mpsc::UnboundedSender<ApplyNotice>,
    ) -> std::io::Result<Self> {
        let (tasks, rx) = mpsc::unbounded_channel();
        let applier = Applier {
            member: member.clone(),
            state_machine,
            tracker,
            options,
            notices,
            last_applied: last_applied.0,
            last_term: last_applied.1,
            healthy: true,
        };
        thread::Builder::new()
            .name(format!("applier-{}", member))
            .spawn(move || applier.run(rx))?;
        Ok(Self { tasks })
    }

    /// Queues a task; returns false once the applier thread is gone.
    pub fn submit(&self, task: ApplyTask) -> bool {
        self.tasks.send(task).is_ok()
    }
}

impl Applier {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<ApplyTask>) {
        debug!("Applier for {} started at index {}", self.member, self.last_applied);
        while let Some(task) = rx.blocking_recv() {
            let more = match task {
                ApplyTask::Apply(entries) => self.apply_batch(entries),
                ApplyTask::Restore(snapshot) => self.restore(snapshot),
                ApplyTask::TakeSnapshot => self.take_snapshot(),
            };
            if !more {
                break;
            }
        }
        debug!("Applier for {} stopped at index {}", self.member, self.last_applied);
    }

    fn notify(&self, notice: ApplyNotice) -> bool {
        self.notices.send(notice).is_ok()
    }

    fn apply_batch(&mut self, entries: Vec<LogEntry>) -> bool {
        if !self.healthy {
            return true;
        }
        let mut outcomes = Vec::new();
        let mut progressed = false;
        for entry in entries {
            if entry.index <= self.last_applied {
                continue;
            }
            if entry.index != self.last_applied + 1 {
                error!(
                    "Member {} applier received index {} after {}",
                    self.member, entry.index, self.last_applied
                );
                return self.fail(
                    entry.index,
                    ApplyError::Internal(format!("gap before index {}", entry.index)),
                );
            }
            if entry.kind == EntryKind::Normal {
                match self.apply_with_retry(&entry) {
                    Ok(tx_id) => outcomes.push((entry.index, tx_id)),
                    Err(e) => {
                        if progressed {
                            self.notify(ApplyNotice::Applied {
                                index: self.last_applied,
                                outcomes,
                            });
                        }
                        return self.fail(entry.index, e);
                    }
                }
            }
            self.last_applied = entry.index;
            self.last_term = entry.term;
            self.tracker.publish(entry.index);
            progressed = true;
        }
        if progressed {
            return self.notify(ApplyNotice::Applied {
                index: self.last_applied,
                outcomes,
            });
        }
        true
    }

    fn apply_with_retry(&self, entry: &LogEntry) -> ApplyResult<u64> {
        let mut backoff = self.options.retry_backoff;
        let mut attempt = 0;
        loop {
            match self.state_machine.apply(entry.index, &entry.command) {
                Ok(tx_id) => return Ok(tx_id),
                Err(e) if attempt < self.options.retry_limit && e.severity() != ErrorSeverity::Fatal => {
                    attempt += 1;
                    warn!(
                        "Member {} failed to apply index {} (attempt {}): {}, retrying in {:?}",
                        self.member, entry.index, attempt, e, backoff
                    );
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(self.options.max_retry_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn fail(&mut self, index: u64, error: ApplyError) -> bool {
        error!(
            "Member {} cannot apply index {}: {} - marking unhealthy",
            self.member, index, error
        );
        self.healthy = false;
        self.notify(ApplyNotice::Failed { index, error })
    }

    fn restore(&mut self, snapshot: Snapshot) -> bool {
        let index = snapshot.meta.last_included_index;
        if index <= self.last_applied && self.healthy {
            debug!("Member {} skips restore of older snapshot {}", self.member, index);
            return true;
        }
        match self
            .state_machine
            .restore(index, snapshot.meta.store_id, &snapshot.data)
        {
            Ok(()) => {
                info!(
                    "Member {} restored snapshot at index {} term {}",
                    self.member, index, snapshot.meta.last_included_term
                );
                self.last_applied = index;
                self.last_term = snapshot.meta.last_included_term;
                self.healthy = true;
                self.tracker.publish(index);
                self.notify(ApplyNotice::Restored { index })
            }
            Err(e) => self.fail(index, e),
        }
    }

    fn take_snapshot(&mut self) -> bool {
        if !self.healthy || self.last_applied == 0 {
            return true;
        }
        match self.state_machine.snapshot() {
            Ok(data) => self.notify(ApplyNotice::SnapshotTaken {
                index: self.last_applied,
                term: self.last_term,
                data,
            }),
            Err(e) => {
                warn!("Member {} failed to capture snapshot: {}", self.member, e);
                self.notify(ApplyNotice::SnapshotFailed(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvCommand, KvStore};

    fn put(index: u64, key: &str) -> LogEntry {
        LogEntry::normal(index, 1, KvCommand::put(key, "v").encode())
    }

    fn spawn(
        store: Arc<KvStore>,
        tracker: ConsistencyTracker,
    ) -> (ApplierHandle, mpsc::UnboundedReceiver<ApplyNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let options = ApplierOptions {
            retry_limit: 2,
            retry_backoff: Duration::from_millis(1),
            max_retry_backoff: Duration::from_millis(2),
        };
        let handle =
            ApplierHandle::spawn(MemberId::new("m"), store, tracker, options, (0, 0), tx).unwrap();
        (handle, rx)
    }

    #[tokio::test]
    async fn applies_in_order_exactly_once() {
        let store = Arc::new(KvStore::new());
        let tracker = ConsistencyTracker::new(0);
        let (handle, mut rx) = spawn(store.clone(), tracker.clone());

        handle.submit(ApplyTask::Apply(vec![put(1, "a"), LogEntry::noop(2, 1), put(3, "b")]));
        handle.submit(ApplyTask::Apply(vec![put(3, "b"), put(4, "c")]));

        match rx.recv().await.unwrap() {
            ApplyNotice::Applied { index, outcomes } => {
                assert_eq!(index, 3);
                assert_eq!(outcomes.iter().map(|o| o.0).collect::<Vec<_>>(), vec![1, 3]);
            }
            other => panic!("unexpected notice {:?}", other),
        }
        match rx.recv().await.unwrap() {
            ApplyNotice::Applied { index, outcomes } => {
                assert_eq!(index, 4);
                assert_eq!(outcomes.len(), 1);
            }
            other => panic!("unexpected notice {:?}", other),
        }
        assert_eq!(store.history(), vec!["a", "b", "c"]);
        assert_eq!(tracker.applied(), 4);
    }

    #[tokio::test]
    async fn failure_marks_unhealthy_and_never_skips() {
        let store = Arc::new(KvStore::new());
        store.fail_key("bad");
        let tracker = ConsistencyTracker::new(0);
        let (handle, mut rx) = spawn(store.clone(), tracker.clone());

        handle.submit(ApplyTask::Apply(vec![put(1, "a"), put(2, "bad"), put(3, "c")]));
        handle.submit(ApplyTask::Apply(vec![put(4, "d")]));

        assert!(matches!(rx.recv().await.unwrap(), ApplyNotice::Applied { index: 1, .. }));
        assert!(matches!(rx.recv().await.unwrap(), ApplyNotice::Failed { index: 2, .. }));
        handle.submit(ApplyTask::TakeSnapshot);
        drop(handle);
        assert!(rx.recv().await.is_none());
        assert_eq!(store.history(), vec!["a"]);
        assert_eq!(tracker.applied(), 1);
    }
}
