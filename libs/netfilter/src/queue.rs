//! The NFQUEUE reader: inline, verdict-returning.
//!
//! A verdict callback decides accept/drop for every packet handed to it. If
//! the callback itself panics or returns an error, or the caller never set
//! one, the queue fails open: the packet is accepted rather than black-holed.
//! Failures to apply the computed verdict back to the kernel are counted but
//! never halt the reader.

use packet::ParsedPacket;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const DEFAULT_MAX_QUEUE_LEN: u32 = 1_024;
pub const DEFAULT_COPY_LEN: u32 = 256;

/// A caller-supplied decision function: `true` accepts the packet, `false`
/// drops it.
pub type VerdictFn = Box<dyn Fn(&ParsedPacket) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    accepted: AtomicU64,
    dropped: AtomicU64,
    fail_open: AtomicU64,
    verdict_set_errors: AtomicU64,
}

/// The platform-independent verdict core: holds the callback and the
/// counters, and decides what to do with one packet. The Linux backend
/// feeds packets in and reports back whether setting the verdict with the
/// kernel succeeded.
pub struct NfQueueCore {
    max_queue_len: u32,
    copy_len: u32,
    verdict_fn: Mutex<Option<VerdictFn>>,
    counters: Counters,
}

impl NfQueueCore {
    pub fn new(max_queue_len: u32, copy_len: u32) -> Self {
        Self {
            max_queue_len,
            copy_len,
            verdict_fn: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    pub fn max_queue_len(&self) -> u32 {
        self.max_queue_len
    }

    pub fn copy_len(&self) -> u32 {
        self.copy_len
    }

    /// Installs the verdict function. Must be called before `start()`;
    /// packets arriving with no verdict function installed fail open.
    pub fn set_verdict_fn(&self, f: VerdictFn) {
        *self.verdict_fn.lock() = Some(f);
    }

    /// Decides a verdict for one packet. Catches a panicking callback the
    /// same way as a missing one: accept, and count it as a fail-open.
    pub fn decide(&self, packet: &ParsedPacket) -> Verdict {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);

        let guard = self.verdict_fn.lock();
        let outcome = match guard.as_ref() {
            None => None,
            Some(f) => std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(packet))).ok(),
        };
        drop(guard);

        match outcome {
            Some(true) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                Verdict::Accept
            }
            Some(false) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                Verdict::Drop
            }
            None => {
                self.counters.fail_open.fetch_add(1, Ordering::Relaxed);
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                Verdict::Accept
            }
        }
    }

    /// Records that setting a verdict with the kernel failed. Does not
    /// affect the already-decided verdict; the packet has already left the
    /// queue one way or another by the time this is called.
    pub fn record_verdict_set_error(&self) {
        self.counters.verdict_set_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            fail_open: self.counters.fail_open.load(Ordering::Relaxed),
            verdict_set_errors: self.counters.verdict_set_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub processed: u64,
    pub accepted: u64,
    pub dropped: u64,
    pub fail_open: u64,
    pub verdict_set_errors: u64,
}

pub type SharedNfQueueCore = Arc<NfQueueCore>;

#[cfg(test)]
mod tests {
    use super::*;

    fn packet() -> ParsedPacket {
        ParsedPacket {
            src_ip: Some("10.0.0.5".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn no_verdict_fn_fails_open() {
        let core = NfQueueCore::new(DEFAULT_MAX_QUEUE_LEN, DEFAULT_COPY_LEN);
        let v = core.decide(&packet());
        assert_eq!(v, Verdict::Accept);
        assert_eq!(core.stats().fail_open, 1);
        assert_eq!(core.stats().accepted, 1);
    }

    #[test]
    fn panicking_verdict_fn_fails_open_instead_of_crashing_the_reader() {
        let core = NfQueueCore::new(DEFAULT_MAX_QUEUE_LEN, DEFAULT_COPY_LEN);
        core.set_verdict_fn(Box::new(|_pkt| panic!("boom")));
        let v = core.decide(&packet());
        assert_eq!(v, Verdict::Accept);
        assert_eq!(core.stats().fail_open, 1);
    }

    #[test]
    fn verdict_fn_accept_and_drop_are_counted_separately() {
        let core = NfQueueCore::new(DEFAULT_MAX_QUEUE_LEN, DEFAULT_COPY_LEN);
        core.set_verdict_fn(Box::new(|pkt| pkt.src_ip.as_deref() != Some("10.0.0.5")));

        let v = core.decide(&packet());
        assert_eq!(v, Verdict::Drop);
        assert_eq!(core.stats().dropped, 1);
        assert_eq!(core.stats().fail_open, 0);
    }

    #[test]
    fn verdict_set_errors_accumulate_without_affecting_accept_drop_counts() {
        let core = NfQueueCore::new(DEFAULT_MAX_QUEUE_LEN, DEFAULT_COPY_LEN);
        core.set_verdict_fn(Box::new(|_| true));
        core.decide(&packet());
        core.record_verdict_set_error();
        core.record_verdict_set_error();

        let stats = core.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.verdict_set_errors, 2);
    }
}
