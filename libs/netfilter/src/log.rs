//! The NFLOG reader: async, passive, ring-buffered.
//!
//! The ring buffer, statistics, and subscriber fan-out here are entirely
//! platform independent and unit-tested directly; only the kernel
//! subscription itself (`platform::start_log_reader`) is Linux-specific, per
//! the "Platform abstraction for netfilter" design note.

use packet::{MacAddr, ParsedPacket};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use tokio::sync::mpsc;

pub const DEFAULT_RING_CAPACITY: usize = 10_000;
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 100;
const TOP_N: usize = 10;

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub time: Instant,
    pub prefix: String,
    pub in_iface: Option<String>,
    pub out_iface: Option<String>,
    pub src_mac: Option<MacAddr>,
    pub packet: ParsedPacket,
    pub sni: Option<String>,
}

/// Whether a log entry should be classified as a drop or an accept, purely
/// from its prefix: "DROP"/"REJECT" literally, or anything starting with
/// 'D', is a drop; everything else is an accept.
fn is_drop_prefix(prefix: &str) -> bool {
    prefix == "DROP" || prefix == "REJECT" || prefix.starts_with('D')
}

#[derive(Debug, Clone, Default)]
pub struct LogStats {
    pub total: u64,
    pub dropped: u64,
    pub accepted: u64,
    pub by_interface: HashMap<String, u64>,
    pub by_protocol: HashMap<String, u64>,
    pub top_sources: Vec<(String, u64)>,
    pub top_destinations: Vec<(String, u64)>,
}

#[derive(Default)]
struct StatsInner {
    total: u64,
    dropped: u64,
    accepted: u64,
    by_interface: HashMap<String, u64>,
    by_protocol: HashMap<String, u64>,
    by_source: HashMap<String, u64>,
    by_destination: HashMap<String, u64>,
}

fn top_n(map: &HashMap<String, u64>, n: usize) -> Vec<(String, u64)> {
    let mut v: Vec<(String, u64)> = map.iter().map(|(k, c)| (k.clone(), *c)).collect();
    v.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    v.truncate(n);
    v
}

pub struct NfLogReader {
    capacity: usize,
    ring: RwLock<VecDeque<LogEntry>>,
    stats: Mutex<StatsInner>,
    subscribers: Mutex<Vec<mpsc::Sender<LogEntry>>>,
}

impl NfLogReader {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ring: RwLock::new(VecDeque::new()),
            stats: Mutex::new(StatsInner::default()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Records one received entry: appends to the ring (dropping the oldest
    /// 10% in one batch if this insert would overflow capacity), updates
    /// statistics, and fans out to subscribers without blocking.
    pub fn record(&self, entry: LogEntry) {
        {
            let mut ring = self.ring.write();
            if ring.len() >= self.capacity {
                let to_drop = (self.capacity / 10).max(1);
                for _ in 0..to_drop {
                    ring.pop_front();
                }
            }
            ring.push_back(entry.clone());
        }

        {
            let mut stats = self.stats.lock();
            stats.total += 1;
            if is_drop_prefix(&entry.prefix) {
                stats.dropped += 1;
            } else {
                stats.accepted += 1;
            }
            if let Some(iface) = &entry.in_iface {
                *stats.by_interface.entry(iface.clone()).or_default() += 1;
            }
            if let Some(proto) = &entry.packet.protocol {
                *stats.by_protocol.entry(proto.clone()).or_default() += 1;
            }
            if let Some(src) = &entry.packet.src_ip {
                *stats.by_source.entry(src.clone()).or_default() += 1;
            }
            if let Some(dst) = &entry.packet.dst_ip {
                *stats.by_destination.entry(dst.clone()).or_default() += 1;
            }
        }

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(entry.clone()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Returns the most recent `limit` entries, oldest first.
    pub fn get_entries(&self, limit: usize) -> Vec<LogEntry> {
        let ring = self.ring.read();
        let len = ring.len();
        let skip = len.saturating_sub(limit);
        ring.iter().skip(skip).cloned().collect()
    }

    /// A bounded channel receiving new entries. A slow subscriber that
    /// can't keep up simply has entries dropped for it (non-blocking send).
    pub fn subscribe(&self) -> mpsc::Receiver<LogEntry> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn stats(&self) -> LogStats {
        let stats = self.stats.lock();
        LogStats {
            total: stats.total,
            dropped: stats.dropped,
            accepted: stats.accepted,
            by_interface: stats.by_interface.clone(),
            by_protocol: stats.by_protocol.clone(),
            top_sources: top_n(&stats.by_source, TOP_N),
            top_destinations: top_n(&stats.by_destination, TOP_N),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(prefix: &str, src: &str) -> LogEntry {
        LogEntry {
            time: Instant::now(),
            prefix: prefix.to_string(),
            in_iface: Some("eth0".to_string()),
            out_iface: None,
            src_mac: None,
            packet: ParsedPacket {
                src_ip: Some(src.to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            sni: None,
        }
    }

    #[test]
    fn drop_heuristic_matches_literal_and_prefix() {
        assert!(is_drop_prefix("DROP"));
        assert!(is_drop_prefix("REJECT"));
        assert!(is_drop_prefix("DNS-learn")); // starts with 'D'
        assert!(!is_drop_prefix("ACCEPT"));
        assert!(!is_drop_prefix(""));
    }

    #[test]
    fn ring_at_capacity_drops_oldest_ten_percent_in_one_batch() {
        let reader = NfLogReader::new(10);
        for i in 0..10 {
            reader.record(entry("ACCEPT", &format!("1.1.1.{i}")));
        }
        // One more insert beyond capacity should drop the oldest batch (1 entry for cap=10).
        reader.record(entry("ACCEPT", "2.2.2.2"));

        let all = reader.get_entries(20);
        assert_eq!(all.len(), 10);
        assert_eq!(all[0].packet.src_ip.as_deref(), Some("1.1.1.1"));
        assert_eq!(all.last().unwrap().packet.src_ip.as_deref(), Some("2.2.2.2"));
    }

    #[test]
    fn get_entries_returns_chronological_order() {
        let reader = NfLogReader::new(100);
        for i in 0..5 {
            reader.record(entry("ACCEPT", &format!("1.1.1.{i}")));
        }
        let recent = reader.get_entries(3);
        let ips: Vec<_> = recent.iter().map(|e| e.packet.src_ip.clone().unwrap()).collect();
        assert_eq!(ips, vec!["1.1.1.2", "1.1.1.3", "1.1.1.4"]);
    }

    #[tokio::test]
    async fn subscriber_receives_entries_in_arrival_order() {
        let reader = NfLogReader::new(100);
        let mut rx = reader.subscribe();
        reader.record(entry("ACCEPT", "1.1.1.1"));
        reader.record(entry("DROP", "1.1.1.2"));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.packet.src_ip.as_deref(), Some("1.1.1.1"));
        assert_eq!(second.packet.src_ip.as_deref(), Some("1.1.1.2"));
    }

    #[test]
    fn a_dropped_subscriber_channel_is_pruned_without_blocking_others() {
        let reader = NfLogReader::new(100);
        {
            let _rx_then_dropped = reader.subscribe();
        } // receiver dropped, channel now closed
        let _rx_kept = reader.subscribe();

        reader.record(entry("ACCEPT", "1.1.1.1"));
        assert_eq!(reader.subscribers.lock().len(), 1);
    }

    #[test]
    fn stats_classify_drop_vs_accept_and_track_top_sources() {
        let reader = NfLogReader::new(100);
        reader.record(entry("ACCEPT", "1.1.1.1"));
        reader.record(entry("DROP", "1.1.1.1"));
        reader.record(entry("REJECT", "2.2.2.2"));

        let stats = reader.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.top_sources[0], ("1.1.1.1".to_string(), 2));
        assert_eq!(*stats.by_protocol.get("TCP").unwrap(), 3);
    }
}
