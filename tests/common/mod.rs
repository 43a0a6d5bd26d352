#![allow(dead_code)]

pub mod test_cluster;

use std::future::Future;
use std::time::Duration;

use causal_raft::{MemberId, RaftOptions};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn member(i: usize) -> MemberId {
    MemberId::new(format!("core-{}", i))
}

pub fn address(id: &MemberId) -> String {
    format!("mem://{}", id)
}

/// Timings tuned for fast in-process clusters.
pub fn test_options(id: &MemberId, initial: &[MemberId], bootstrap: bool) -> RaftOptions {
    let mut options = RaftOptions::new(id.clone());
    options.initial_members = initial.iter().map(|m| (m.clone(), address(m))).collect();
    options.bootstrap = bootstrap;
    options.election_timeout_min = Duration::from_millis(150);
    options.election_timeout_max = Duration::from_millis(300);
    options.heartbeat_interval = Duration::from_millis(30);
    options.tick_interval = Duration::from_millis(5);
    options.snapshot_retry_interval = Duration::from_millis(100);
    options.client_timeout = Duration::from_secs(3);
    options
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
