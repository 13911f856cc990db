//! In-memory write-back LRU over the flow store.
//!
//! Readers that only need aggregate counters take a shared lock; anything
//! that touches LRU order (`get`, which promotes the entry) or mutates
//! entries (`put`, `invalidate*`, `flush_dirty`) takes the exclusive lock,
//! per the cache-coherence discipline below.

use flow_store::model::{Fingerprint, Flow};
use lru::LruCache;
use parking_lot::RwLock;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

pub const DEFAULT_CAPACITY: usize = 10_000;

/// A cached flow, its precomputed verdict, and whether it needs writing back.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub flow: Flow,
    pub verdict: bool,
    pub dirty: bool,
}

pub struct FlowCache {
    inner: RwLock<LruCache<Fingerprint, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FlowCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            inner: RwLock::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Looks up by fingerprint, promoting the entry to most-recently-used on
    /// hit. Requires the exclusive lock because promotion reorders the LRU.
    pub fn get(&self, fp: &Fingerprint) -> Option<CacheEntry> {
        let mut inner = self.inner.write();
        match inner.get(fp) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Mutates the cached entry in place via `f`, without cloning it out and
    /// back in. Used by the fast path to bump `last_seen`/`occurrences`.
    pub fn update_in_place(&self, fp: &Fingerprint, f: impl FnOnce(&mut CacheEntry)) -> bool {
        let mut inner = self.inner.write();
        match inner.get_mut(fp) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    /// Inserts or overwrites an entry, evicting the least-recently-used
    /// entry if the cache is full.
    pub fn put(&self, fp: Fingerprint, entry: CacheEntry) {
        self.inner.write().put(fp, entry);
    }

    pub fn invalidate(&self, fp: &Fingerprint) {
        self.inner.write().pop(fp);
    }

    /// Drops every cached entry. Used after a bulk store transition (e.g.
    /// `allow_all_pending`) that doesn't have per-row fingerprints to
    /// invalidate individually.
    pub fn clear(&self) {
        self.inner.write().clear();
    }

    /// O(n) — only called on state transitions, which are rare relative to
    /// the packet-path `get`/`put` calls.
    pub fn invalidate_by_id(&self, flow_id: i64) {
        let mut inner = self.inner.write();
        let stale: Vec<Fingerprint> = inner
            .iter()
            .filter(|(_, entry)| entry.flow.id == flow_id)
            .map(|(fp, _)| fp.clone())
            .collect();
        for fp in stale {
            inner.pop(&fp);
        }
    }

    /// Atomically collects every dirty entry, clears their dirty flags, and
    /// returns the snapshots to be written back to the store.
    pub fn flush_dirty(&self) -> Vec<Flow> {
        let mut inner = self.inner.write();
        let mut flushed = Vec::new();
        for (_, entry) in inner.iter_mut() {
            if entry.dirty {
                entry.dirty = false;
                flushed.push(entry.flow.clone());
            }
        }
        flushed
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            len: self.len(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub len: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_store::model::FlowState;

    fn flow(id: i64, mac: &str, port: u16) -> Flow {
        Flow {
            id,
            mac: mac.to_string(),
            proto: "tcp".to_string(),
            port,
            src_ip: None,
            dst_ip: None,
            src_hostname: None,
            policy_label: None,
            state: FlowState::Pending,
            scrutiny: false,
            review_until: None,
            first_seen: 0,
            last_seen: 0,
            occurrences: 1,
            app_label: None,
            vendor: None,
            device_identity: None,
        }
    }

    fn fp(mac: &str, port: u16) -> Fingerprint {
        Fingerprint {
            mac: mac.to_string(),
            proto: "tcp".to_string(),
            port,
        }
    }

    #[test]
    fn get_promotes_and_counts_hit() {
        let cache = FlowCache::new(2);
        cache.put(
            fp("a", 1),
            CacheEntry {
                flow: flow(1, "a", 1),
                verdict: true,
                dirty: false,
            },
        );
        assert!(cache.get(&fp("a", 1)).is_some());
        assert!(cache.get(&fp("nope", 1)).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn evicts_least_recently_used_at_capacity() {
        let cache = FlowCache::new(2);
        let entry = |id, mac| CacheEntry {
            flow: flow(id, mac, 1),
            verdict: true,
            dirty: false,
        };
        cache.put(fp("a", 1), entry(1, "a"));
        cache.put(fp("b", 1), entry(2, "b"));
        cache.get(&fp("a", 1)); // promote a, so b becomes LRU
        cache.put(fp("c", 1), entry(3, "c"));

        assert!(cache.get(&fp("b", 1)).is_none());
        assert!(cache.get(&fp("a", 1)).is_some());
        assert!(cache.get(&fp("c", 1)).is_some());
    }

    #[test]
    fn invalidate_by_id_is_exact() {
        let cache = FlowCache::new(4);
        cache.put(
            fp("a", 1),
            CacheEntry {
                flow: flow(1, "a", 1),
                verdict: true,
                dirty: false,
            },
        );
        cache.put(
            fp("b", 1),
            CacheEntry {
                flow: flow(2, "b", 1),
                verdict: false,
                dirty: false,
            },
        );
        cache.invalidate_by_id(1);
        assert!(cache.get(&fp("a", 1)).is_none());
        assert!(cache.get(&fp("b", 1)).is_some());
    }

    #[test]
    fn flush_dirty_clears_flags_and_returns_snapshots() {
        let cache = FlowCache::new(4);
        cache.put(
            fp("a", 1),
            CacheEntry {
                flow: flow(1, "a", 1),
                verdict: true,
                dirty: true,
            },
        );
        cache.put(
            fp("b", 1),
            CacheEntry {
                flow: flow(2, "b", 1),
                verdict: true,
                dirty: false,
            },
        );

        let flushed = cache.flush_dirty();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].id, 1);
        assert!(cache.flush_dirty().is_empty());
    }
}
