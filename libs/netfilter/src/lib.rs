//! Netfilter integration: a passive NFLOG reader and an inline NFQUEUE
//! reader, each split into a platform-independent core (ring buffer,
//! statistics, verdict bookkeeping) and a Linux netlink backend.

pub mod log;
pub mod queue;

#[cfg(target_os = "linux")]
#[path = "linux.rs"]
mod platform;

#[cfg(not(target_os = "linux"))]
#[path = "other.rs"]
mod platform;

pub use log::{LogEntry, LogStats, NfLogReader, DEFAULT_RING_CAPACITY};
pub use queue::{NfQueueCore, Verdict, VerdictFn, QueueStats, DEFAULT_COPY_LEN, DEFAULT_MAX_QUEUE_LEN};

use std::sync::Arc;

/// Spawns the NFLOG reader task bound to `group`, feeding `reader`.
pub fn spawn_log_reader(group: u16, reader: Arc<NfLogReader>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(error) = platform::run_log_reader(group, reader).await {
            tracing::error!(%error, "NFLOG reader exited");
        }
    })
}

/// Spawns the NFQUEUE reader task bound to `queue_num`, feeding `core`.
pub fn spawn_queue_reader(
    queue_num: u16,
    core: Arc<NfQueueCore>,
) -> tokio::task::JoinHandle<()> {
    let max_len = core.max_queue_len();
    let copy_len = core.copy_len();
    tokio::spawn(async move {
        if let Err(error) = platform::run_queue_reader(queue_num, max_len, copy_len, core).await {
            tracing::error!(%error, "NFQUEUE reader exited");
        }
    })
}
