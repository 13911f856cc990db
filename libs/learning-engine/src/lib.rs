//! Coordinates the flow store, flow cache, and DNS cache behind a single
//! verdict port for the netfilter readers.
//!
//! The cache/store split is the hot path: `process_packet` never touches
//! SQLite on a cache hit. State transitions (`allow_flow`/`deny_flow`)
//! invalidate the cache entry *before* invoking their callback — see
//! `invalidate_by_id`'s doc comment in `flow-cache` for why the ordering
//! matters.

pub mod app_label;
pub mod clock;
pub mod port_scan;
pub mod rate_limit;

use clock::SharedClock;
use dns_cache::{DnsCache, Source as DnsSource};
use flow_cache::{CacheEntry, FlowCache};
use flow_store::model::{Fingerprint, Flow, FlowState, HintSource, NewFlow};
use flow_store::FlowStore;
use notifications::{NotificationHub, Severity};
use port_scan::PortScanTracker;
use rate_limit::RateLimiter;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

const NOTIF_PERIOD: Duration = Duration::from_secs(30);
const SCAN_ALERT_PERIOD: Duration = Duration::from_secs(60 * 60);
const REVERSE_DNS_QUEUE_DEPTH: usize = 1_000;

/// One packet's worth of flow-identifying fields, handed to the engine by
/// whatever reader observed it.
#[derive(Debug, Clone)]
pub struct Observation {
    pub mac: String,
    pub proto: String,
    pub port: u16,
    pub src_ip: Option<String>,
    pub dst_ip: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceIdentity {
    pub vendor: Option<String>,
    pub device_identity: Option<String>,
}

pub trait DeviceManager: Send + Sync {
    fn identify(&self, mac: &str) -> Option<DeviceIdentity>;
}

pub type FlowCallback = Box<dyn Fn(Flow) + Send + Sync>;

pub struct LearningEngineBuilder {
    store: FlowStore,
    cache: Arc<FlowCache>,
    dns: Arc<DnsCache>,
    notifications: Arc<NotificationHub>,
    device_manager: Option<Arc<dyn DeviceManager>>,
    on_allowed: Option<FlowCallback>,
    on_denied: Option<FlowCallback>,
    new_flow_callback: Option<FlowCallback>,
    clock: SharedClock,
}

impl LearningEngineBuilder {
    pub fn new(store: FlowStore, cache: Arc<FlowCache>, dns: Arc<DnsCache>, notifications: Arc<NotificationHub>) -> Self {
        Self {
            store,
            cache,
            dns,
            notifications,
            device_manager: None,
            on_allowed: None,
            on_denied: None,
            new_flow_callback: None,
            clock: clock::system(),
        }
    }

    pub fn device_manager(mut self, dm: Arc<dyn DeviceManager>) -> Self {
        self.device_manager = Some(dm);
        self
    }

    pub fn on_allowed(mut self, f: FlowCallback) -> Self {
        self.on_allowed = Some(f);
        self
    }

    pub fn on_denied(mut self, f: FlowCallback) -> Self {
        self.on_denied = Some(f);
        self
    }

    pub fn new_flow_callback(mut self, f: FlowCallback) -> Self {
        self.new_flow_callback = Some(f);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Arc<LearningEngine> {
        let (reverse_dns_tx, reverse_dns_rx) = mpsc::channel(REVERSE_DNS_QUEUE_DEPTH);
        Arc::new(LearningEngine {
            store: self.store,
            cache: self.cache,
            dns: self.dns,
            notifications: self.notifications,
            learning_mode: AtomicBool::new(false),
            device_manager: self.device_manager,
            on_allowed: self.on_allowed,
            on_denied: self.on_denied,
            new_flow_callback: self.new_flow_callback,
            port_scan: PortScanTracker::new(self.clock.clone()),
            scan_alert_limiter: RateLimiter::new(self.clock.clone(), SCAN_ALERT_PERIOD),
            notif_limiter: RateLimiter::new(self.clock, NOTIF_PERIOD),
            reverse_dns_tx,
            reverse_dns_rx: AsyncMutex::new(Some(reverse_dns_rx)),
        })
    }
}

pub struct LearningEngine {
    store: FlowStore,
    cache: Arc<FlowCache>,
    dns: Arc<DnsCache>,
    notifications: Arc<NotificationHub>,
    learning_mode: AtomicBool,
    device_manager: Option<Arc<dyn DeviceManager>>,
    on_allowed: Option<FlowCallback>,
    on_denied: Option<FlowCallback>,
    new_flow_callback: Option<FlowCallback>,
    port_scan: PortScanTracker,
    scan_alert_limiter: RateLimiter,
    notif_limiter: RateLimiter,
    reverse_dns_tx: mpsc::Sender<(i64, IpAddr)>,
    reverse_dns_rx: AsyncMutex<Option<mpsc::Receiver<(i64, IpAddr)>>>,
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

fn to_hint_source(source: DnsSource) -> HintSource {
    match source {
        DnsSource::DnsSnoop => HintSource::DnsSnoop,
        DnsSource::SniPeek => HintSource::SniPeek,
        DnsSource::ReverseDns => HintSource::ReverseDns,
    }
}

impl LearningEngine {
    pub fn set_learning_mode(&self, enabled: bool) {
        self.learning_mode.store(enabled, Ordering::Relaxed);
    }

    pub fn learning_mode(&self) -> bool {
        self.learning_mode.load(Ordering::Relaxed)
    }

    /// The packet-path entry point: cache fast path, store slow path, or
    /// flow creation.
    pub async fn process_packet(&self, obs: Observation) -> anyhow::Result<bool> {
        let fp = Fingerprint {
            mac: obs.mac.clone(),
            proto: obs.proto.clone(),
            port: obs.port,
        };

        // 1. Cache fast path.
        let mut hit = false;
        let mut verdict = false;
        self.cache.update_in_place(&fp, |entry| {
            hit = true;
            entry.flow.last_seen = now_unix();
            entry.flow.occurrences += 1;
            if obs.src_ip.is_some() {
                entry.flow.src_ip = obs.src_ip.clone();
            }
            if obs.dst_ip.is_some() {
                entry.flow.dst_ip = obs.dst_ip.clone();
            }
            entry.dirty = true;
            verdict = entry.verdict;
        });
        if hit {
            return Ok(verdict);
        }

        // 2. Store slow path.
        if let Some(existing) = self.store.find(&obs.mac, &obs.proto, obs.port).await? {
            let new = NewFlow {
                mac: obs.mac.clone(),
                proto: obs.proto.clone(),
                port: obs.port,
                src_ip: obs.src_ip.clone(),
                dst_ip: obs.dst_ip.clone(),
                src_hostname: existing.src_hostname.clone(),
                policy_label: existing.policy_label.clone(),
                state: existing.state,
                app_label: existing.app_label.clone(),
                vendor: existing.vendor.clone(),
                device_identity: existing.device_identity.clone(),
                now: now_unix(),
            };
            let updated = self.store.upsert(new).await?;
            let verdict = match updated.state {
                FlowState::Allowed => true,
                FlowState::Denied => false,
                FlowState::Pending => self.learning_mode(),
            };
            self.cache.put(
                fp,
                CacheEntry {
                    flow: updated,
                    verdict,
                    dirty: false,
                },
            );
            return Ok(verdict);
        }

        // 3. Creation.
        let learning = self.learning_mode();
        let flow = self.create_flow(&obs.mac, &obs.proto, obs.port, obs.src_ip.clone(), obs.dst_ip.clone()).await?;

        if !learning {
            let scanning = self.port_scan.record_and_check(&obs.mac, obs.port);
            if scanning {
                if self.scan_alert_limiter.allow(&obs.mac) {
                    self.notifications.publish(
                        Severity::Warning,
                        "Port scan detected",
                        format!("{} is contacting an unusual number of distinct ports", obs.mac),
                    );
                }
            } else if self.notif_limiter.allow(&obs.mac) {
                self.notifications.publish(
                    Severity::Info,
                    "New flow",
                    format!("New flow from {} to port {}", obs.mac, obs.port),
                );
            }
        }

        if let Some(cb) = &self.new_flow_callback {
            cb(flow.clone());
        }

        Ok(flow.state == FlowState::Allowed)
    }

    /// Looks up the TCP/443 flow for `mac`, labels it from `sni` if unlabeled,
    /// records a high-confidence hint, and creates the flow first if it
    /// doesn't exist yet.
    pub async fn process_sni(&self, mac: &str, src_ip: &str, dst_ip: &str, sni: &str) -> anyhow::Result<()> {
        let flow = match self.store.find(mac, "tcp", 443).await? {
            Some(flow) => flow,
            None => {
                self.create_flow(mac, "tcp", 443, Some(src_ip.to_string()), Some(dst_ip.to_string())).await?
            }
        };

        if flow.app_label.is_none() || flow.vendor.is_none() {
            let app_label = app_label::lookup(sni).map(str::to_string);
            let vendor = crate::vendor_for(mac, self.device_manager.as_deref());
            self.store.update_labels(flow.id, app_label, vendor).await?;
        }

        self.store.add_hint(flow.id, sni.to_string(), HintSource::SniPeek).await?;
        self.cache.invalidate_by_id(flow.id);
        Ok(())
    }

    async fn create_flow(
        &self,
        mac: &str,
        proto: &str,
        port: u16,
        src_ip: Option<String>,
        dst_ip: Option<String>,
    ) -> anyhow::Result<Flow> {
        let learning = self.learning_mode();
        let state = if learning { FlowState::Allowed } else { FlowState::Pending };

        let (vendor, device_identity) = match &self.device_manager {
            Some(dm) => {
                let identity = dm.identify(mac).unwrap_or_default();
                (identity.vendor, identity.device_identity)
            }
            None => (vendor::lookup(mac).map(str::to_string), None),
        };

        let fp = Fingerprint {
            mac: mac.to_string(),
            proto: proto.to_string(),
            port,
        };

        let flow = self
            .store
            .upsert(NewFlow {
                mac: mac.to_string(),
                proto: proto.to_string(),
                port,
                src_ip: src_ip.clone(),
                dst_ip: dst_ip.clone(),
                src_hostname: None,
                policy_label: None,
                state,
                app_label: None,
                vendor,
                device_identity,
                now: now_unix(),
            })
            .await?;

        self.cache.put(
            fp,
            CacheEntry {
                flow: flow.clone(),
                verdict: state == FlowState::Allowed,
                dirty: false,
            },
        );

        self.enrich_with_dns(&flow, dst_ip).await;

        if learning {
            if let Some(cb) = &self.on_allowed {
                cb(flow.clone());
            }
        }

        Ok(flow)
    }

    async fn enrich_with_dns(&self, flow: &Flow, dst_ip: Option<String>) {
        let Some(ip) = dst_ip.and_then(|s| s.parse::<IpAddr>().ok()) else {
            return;
        };
        if let Some((domain, source)) = self.dns.get_with_source(&ip) {
            let _ = self.store.add_hint(flow.id, domain, to_hint_source(source)).await;
            return;
        }
        if self.reverse_dns_tx.try_send((flow.id, ip)).is_err() {
            tracing::debug!(flow_id = flow.id, "reverse DNS queue full, dropping enrichment request");
        }
    }

    pub async fn allow_flow(&self, id: i64) -> anyhow::Result<()> {
        self.store.update_state(id, FlowState::Allowed).await?;
        self.cache.invalidate_by_id(id);
        if let Some(cb) = &self.on_allowed {
            if let Some(flow) = self.store.get(id).await? {
                cb(flow);
            }
        }
        Ok(())
    }

    pub async fn deny_flow(&self, id: i64) -> anyhow::Result<()> {
        self.store.update_state(id, FlowState::Denied).await?;
        self.cache.invalidate_by_id(id);
        if let Some(cb) = &self.on_denied {
            if let Some(flow) = self.store.get(id).await? {
                cb(flow);
            }
        }
        Ok(())
    }

    pub async fn allow_with_scrutiny(&self, id: i64, review_after: i64) -> anyhow::Result<()> {
        self.allow_flow(id).await?;
        self.store.set_scrutiny(id, true, Some(review_after)).await
    }

    pub async fn allow_all_pending(&self) -> anyhow::Result<usize> {
        let n = self.store.allow_all_pending().await?;
        self.cache.clear();
        Ok(n)
    }

    async fn flush_dirty_once(&self) -> anyhow::Result<()> {
        for flow in self.cache.flush_dirty() {
            self.store.save(&flow).await?;
        }
        Ok(())
    }

    /// Starts the hourly retention cleanup, the 5-second dirty flush, and
    /// the reverse-DNS consumer. Returns their handles so the caller can
    /// manage shutdown.
    pub fn spawn_workers(self: Arc<Self>, retention_days: i64) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let engine = self.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            loop {
                interval.tick().await;
                if let Err(error) = engine.store.cleanup(retention_days).await {
                    tracing::warn!(%error, "retention cleanup failed");
                }
            }
        }));

        let engine = self.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                if let Err(error) = engine.flush_dirty_once().await {
                    tracing::warn!(%error, "dirty flush failed");
                }
            }
        }));

        let engine = self.clone();
        handles.push(tokio::spawn(async move {
            let rx = engine.reverse_dns_rx.lock().await.take();
            let Some(mut rx) = rx else { return };
            while let Some((flow_id, ip)) = rx.recv().await {
                match engine.dns.lookup_reverse(ip).await {
                    Ok(domain) => {
                        if let Err(error) = engine.store.add_hint(flow_id, domain, HintSource::ReverseDns).await {
                            tracing::warn!(%error, flow_id, "failed to record reverse DNS hint");
                        }
                    }
                    Err(error) => tracing::debug!(%error, flow_id, %ip, "reverse DNS lookup failed"),
                }
            }
        }));

        handles
    }

    /// Flushes outstanding dirty cache entries. Call before the store is
    /// dropped.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.flush_dirty_once().await
    }
}

mod vendor;

fn vendor_for(mac: &str, device_manager: Option<&dyn DeviceManager>) -> Option<String> {
    if let Some(dm) = device_manager {
        if let Some(identity) = dm.identify(mac) {
            if identity.vendor.is_some() {
                return identity.vendor;
            }
        }
    }
    vendor::lookup(mac).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    async fn harness() -> (Arc<LearningEngine>, Arc<FlowCache>, Arc<NotificationHub>) {
        let store = FlowStore::open_in_memory().await.unwrap();
        let cache = Arc::new(FlowCache::new(100));
        let dns = Arc::new(DnsCache::new());
        let notifications = Arc::new(NotificationHub::new(100));
        let engine = LearningEngineBuilder::new(store, cache.clone(), dns, notifications.clone()).build();
        (engine, cache, notifications)
    }

    fn obs(mac: &str, port: u16) -> Observation {
        Observation {
            mac: mac.to_string(),
            proto: "tcp".to_string(),
            port,
            src_ip: Some("192.168.1.10".to_string()),
            dst_ip: Some("1.1.1.1".to_string()),
        }
    }

    #[tokio::test]
    async fn learning_mode_auto_allows_new_flow() {
        let allowed_count = Arc::new(AtomicUsize::new(0));
        let counted = allowed_count.clone();

        let store = FlowStore::open_in_memory().await.unwrap();
        let cache = Arc::new(FlowCache::new(100));
        let dns = Arc::new(DnsCache::new());
        let notifications = Arc::new(NotificationHub::new(100));
        let engine = LearningEngineBuilder::new(store, cache, dns, notifications)
            .on_allowed(Box::new(move |_flow| {
                counted.fetch_add(1, Ordering::SeqCst);
            }))
            .build();
        engine.set_learning_mode(true);

        let verdict = engine.process_packet(obs("aa:bb:cc:dd:ee:01", 443)).await.unwrap();
        assert!(verdict);
        assert_eq!(allowed_count.load(Ordering::SeqCst), 1);

        let flows = engine.store.list(Default::default()).await.unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].state, FlowState::Allowed);
    }

    #[tokio::test]
    async fn denied_flow_short_circuits_without_touching_store_again() {
        let (engine, _cache, _notif) = harness().await;
        engine.set_learning_mode(true);
        engine.process_packet(obs("aa:bb:cc:dd:ee:01", 443)).await.unwrap();

        let flow = engine.store.find("aa:bb:cc:dd:ee:01", "tcp", 443).await.unwrap().unwrap();
        engine.deny_flow(flow.id).await.unwrap();
        engine.set_learning_mode(false);

        let verdict = engine.process_packet(obs("aa:bb:cc:dd:ee:01", 443)).await.unwrap();
        assert!(!verdict);
    }

    #[tokio::test]
    async fn port_scan_suppresses_per_flow_notification_and_fires_once() {
        let (engine, _cache, notifications) = harness().await;
        // learning mode defaults to false

        for port in 1..=11u16 {
            engine.process_packet(obs("aa:bb:cc:dd:ee:02", port)).await.unwrap();
        }

        let published = notifications.get_all();
        let scan_alerts = published.iter().filter(|n| n.title == "Port scan detected").count();
        assert_eq!(scan_alerts, 1);
    }

    #[tokio::test]
    async fn process_sni_labels_flow_and_records_hint() {
        let (engine, _cache, _notif) = harness().await;
        engine
            .process_sni("aa:bb:cc:dd:ee:03", "192.168.1.10", "93.184.216.34", "www.netflix.com")
            .await
            .unwrap();

        let flow = engine.store.find("aa:bb:cc:dd:ee:03", "tcp", 443).await.unwrap().unwrap();
        assert_eq!(flow.app_label.as_deref(), Some("Netflix"));

        let hints = engine.store.get_hints(flow.id).await.unwrap();
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].confidence, 100);
    }

    #[tokio::test]
    async fn allow_with_scrutiny_sets_both_state_and_flag() {
        let (engine, _cache, _notif) = harness().await;
        engine.process_packet(obs("aa:bb:cc:dd:ee:04", 22)).await.unwrap();
        let flow = engine.store.find("aa:bb:cc:dd:ee:04", "tcp", 22).await.unwrap().unwrap();

        engine.allow_with_scrutiny(flow.id, now_unix() + 3600).await.unwrap();

        let updated = engine.store.get(flow.id).await.unwrap().unwrap();
        assert_eq!(updated.state, FlowState::Allowed);
        assert!(updated.scrutiny);
    }
}
