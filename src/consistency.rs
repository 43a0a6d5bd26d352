//! Tracks the locally applied index and lets readers wait for it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::ClientError;

#[derive(Default)]
struct Waiters {
    next_id: u64,
    by_target: BTreeMap<u64, HashMap<u64, oneshot::Sender<u64>>>,
}

#[derive(Default)]
struct Inner {
    applied: AtomicU64,
    waiters: Mutex<Waiters>,
}

/// Shared between the applier, which publishes, and any number of readers.
#[derive(Clone, Default)]
pub struct ConsistencyTracker {
    inner: Arc<Inner>,
}

impl ConsistencyTracker {
    pub fn new(applied: u64) -> Self {
        let tracker = Self::default();
        tracker.inner.applied.store(applied, Ordering::SeqCst);
        tracker
    }

    pub fn applied(&self) -> u64 {
        self.inner.applied.load(Ordering::SeqCst)
    }

    /// Records that everything up to `index` is applied and wakes the
    /// waiters it satisfies.
    pub fn publish(&self, index: u64) {
        let applied = self.inner.applied.fetch_max(index, Ordering::SeqCst).max(index);
        let ready = {
            let mut waiters = self.inner.waiters.lock();
            let pending = waiters.by_target.split_off(&(applied + 1));
            std::mem::replace(&mut waiters.by_target, pending)
        };
        for (_, senders) in ready {
            for (_, tx) in senders {
                let _ = tx.send(applied);
            }
        }
    }

    /// Resolves once the applied index reaches `target`, or fails with
    /// `ClientError::Timeout` after `timeout`.
    pub async fn await_applied_at_least(
        &self,
        target: u64,
        timeout: Duration,
    ) -> Result<u64, ClientError> {
        let applied = self.applied();
        if applied >= target {
            return Ok(applied);
        }

        let (tx, rx) = oneshot::channel();
        let id = {
            let mut waiters = self.inner.waiters.lock();
            // re-check under the lock so a concurrent publish cannot be missed
            let applied = self.applied();
            if applied >= target {
                return Ok(applied);
            }
            waiters.next_id += 1;
            let id = waiters.next_id;
            waiters.by_target.entry(target).or_default().insert(id, tx);
            id
        };
        let _guard = Registration {
            tracker: self,
            target,
            id,
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(applied)) => Ok(applied),
            Ok(Err(_)) => Err(ClientError::Shutdown),
            Err(_) => Err(ClientError::Timeout {
                target,
                applied: self.applied(),
            }),
        }
    }

    /// Number of readers currently waiting.
    pub fn waiter_count(&self) -> usize {
        self.inner
            .waiters
            .lock()
            .by_target
            .values()
            .map(HashMap::len)
            .sum()
    }

    fn deregister(&self, target: u64, id: u64) {
        let mut waiters = self.inner.waiters.lock();
        if let Some(senders) = waiters.by_target.get_mut(&target) {
            senders.remove(&id);
            if senders.is_empty() {
                waiters.by_target.remove(&target);
            }
        }
    }
}

/// Removes a waiter when its future completes or is dropped.
struct Registration<'a> {
    tracker: &'a ConsistencyTracker,
    target: u64,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.tracker.deregister(self.target, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_immediately_when_already_applied() {
        let tracker = ConsistencyTracker::new(10);
        let applied = tracker
            .await_applied_at_least(7, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(applied, 10);
        assert_eq!(tracker.waiter_count(), 0);
    }

    #[tokio::test]
    async fn publish_wakes_only_satisfied_waiters() {
        let tracker = ConsistencyTracker::new(0);
        let low = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.await_applied_at_least(3, Duration::from_secs(5)).await }
        });
        let high = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.await_applied_at_least(9, Duration::from_millis(200)).await }
        });
        while tracker.waiter_count() < 2 {
            tokio::task::yield_now().await;
        }

        tracker.publish(5);
        assert_eq!(low.await.unwrap(), Ok(5));
        let err = high.await.unwrap().unwrap_err();
        assert_eq!(err, ClientError::Timeout { target: 9, applied: 5 });
        assert_eq!(tracker.waiter_count(), 0);
    }

    #[tokio::test]
    async fn dropped_waiters_are_deregistered() {
        let tracker = ConsistencyTracker::new(0);
        let waiting = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.await_applied_at_least(100, Duration::from_secs(60)).await }
        });
        while tracker.waiter_count() == 0 {
            tokio::task::yield_now().await;
        }
        waiting.abort();
        let _ = waiting.await;
        assert_eq!(tracker.waiter_count(), 0);
    }

    #[test]
    fn applied_never_goes_backwards() {
        let tracker = ConsistencyTracker::new(0);
        tracker.publish(8);
        tracker.publish(4);
        assert_eq!(tracker.applied(), 8);
    }
}
