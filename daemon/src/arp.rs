//! A small cache mapping source IPs to hardware addresses, refreshed from
//! the kernel neighbor table the same way `IpCommandUidRouter` shells out
//! to `ip` rather than depending on a netlink crate's neighbor support.
//!
//! NFQUEUE packets carry no link-layer header (the kernel hands over the
//! L3 payload only), so the learning engine's MAC-keyed fingerprint has to
//! be resolved out of band. Populating the cache from a periodic `ip
//! neigh show` keeps the verdict hot path free of any subprocess I/O: a
//! miss just means the neighbor table hasn't been refreshed since that
//! host last spoke, and the packet fails open rather than blocking.

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::process::Command;

pub struct ArpCache {
    entries: Mutex<HashMap<String, String>>,
}

impl Default for ArpCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ArpCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Non-blocking lookup against the last-refreshed snapshot.
    pub fn resolve(&self, ip: &str) -> Option<String> {
        self.entries.lock().get(ip).cloned()
    }

    async fn refresh(&self) {
        let Ok(output) = Command::new("ip").args(["neigh", "show"]).output().await else {
            return;
        };
        if !output.status.success() {
            return;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let mut fresh = HashMap::new();
        for line in text.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let Some(ip) = fields.first() else { continue };
            let Some(lladdr_pos) = fields.iter().position(|f| *f == "lladdr") else { continue };
            let Some(mac) = fields.get(lladdr_pos + 1) else { continue };
            fresh.insert(ip.to_string(), mac.to_string());
        }
        *self.entries.lock() = fresh;
    }
}

/// Spawns the periodic neighbor-table refresh, returning the cache for
/// callers to query.
pub fn spawn(interval: std::time::Duration) -> std::sync::Arc<ArpCache> {
    let cache = std::sync::Arc::new(ArpCache::new());
    let refresher = cache.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            refresher.refresh().await;
        }
    });
    cache
}
