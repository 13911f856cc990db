//! Entry point for the privileged control-plane daemon: parses the small
//! set of deployment-path flags the core owns (the unprivileged peer owns
//! the real CLI), wires every subsystem together, and runs until asked to
//! stop.

mod arp;
mod firewall;
mod handlers;
mod logging;
mod netlink;
mod signals;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Config, ConfigFile, FileConfigHandle};
use dns_cache::DnsCache;
use firewall::FirewallService;
use flow_cache::FlowCache;
use flow_store::FlowStore;
use learning_engine::{LearningEngineBuilder, Observation};
use netfilter::{spawn_log_reader, spawn_queue_reader, NfLogReader, NfQueueCore};
use netlink::{HealthTrackingUplinkGroups, InterfaceSnapshot, IpCommandUidRouter, RtNetlink, SafeInterfaceConfigurator};
use notifications::NotificationHub;
use rpc::RpcServer;
use safe_apply::{DefaultConnectivityChecker, SafeApplyManager};
use services::{CronScheduler, ReloadCoordinator, ServiceOrchestrator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const DEFAULT_FLOW_CACHE_CAPACITY: usize = 10_000;
const DEFAULT_NOTIFICATION_CAPACITY: usize = 256;
const DEFAULT_FLOW_RETENTION_DAYS: i64 = 90;
const DNS_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const ARP_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "border-daemon", about = "Privileged netfilter/routing control plane")]
struct Cli {
    /// Unix-domain socket the RPC server listens on.
    #[arg(long, env = "BORDER_SOCKET_PATH")]
    socket_path: Option<PathBuf>,

    /// Directory the flow store database and other persistent state live under.
    #[arg(long, env = "BORDER_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Directory the rolling log file is written to.
    #[arg(long, env = "BORDER_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Directory holding the on-disk configuration file.
    #[arg(long, env = "BORDER_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// `tracing_subscriber::EnvFilter` directive string, reloadable over RPC.
    #[arg(long, env = "BORDER_LOG_FILTER", default_value = "info")]
    log_filter: String,

    /// Emit stdout logs as JSON instead of the ANSI-aware human format.
    #[arg(long)]
    stdout_json: bool,

    /// Name of the interface safe-apply guards — typically the management
    /// or WAN link an operator could otherwise lock themselves out of.
    #[arg(long, env = "BORDER_SAFE_APPLY_INTERFACE", default_value = "eth0")]
    safe_apply_interface: String,

    /// NFLOG group carrying drop/accept log entries.
    #[arg(long, default_value_t = 0)]
    nflog_group: u16,

    /// NFQUEUE number the inline verdict queue attaches to.
    #[arg(long, default_value_t = 0)]
    nfqueue_num: u16,

    #[arg(long, default_value_t = DEFAULT_FLOW_CACHE_CAPACITY)]
    flow_cache_capacity: usize,

    #[arg(long, default_value_t = DEFAULT_NOTIFICATION_CAPACITY)]
    notification_capacity: usize,

    #[arg(long, default_value_t = DEFAULT_FLOW_RETENTION_DAYS)]
    flow_retention_days: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let state_dir = cli.state_dir.clone().or_else(known_dirs::state_dir).context("no state directory configured or available for this platform")?;
    let log_dir = cli.log_dir.clone().or_else(known_dirs::daemon_logs).context("no log directory configured or available for this platform")?;
    let config_dir = cli.config_dir.clone().or_else(known_dirs::config_dir).context("no config directory configured or available for this platform")?;
    let socket_path = cli.socket_path.clone().unwrap_or_else(known_dirs::ipc_socket);

    let _logging = logging::setup(&log_dir, &cli.log_filter, cli.stdout_json).context("failed to set up logging")?;
    tracing::info!(?socket_path, ?state_dir, "starting border-daemon");

    let flow_db = state_dir.join("flows.db");
    let store = FlowStore::open(&flow_db).await.context("failed to open flow store")?;
    let flow_cache = Arc::new(FlowCache::new(cli.flow_cache_capacity));
    let dns_cache = Arc::new(DnsCache::new());
    let notifications = Arc::new(NotificationHub::new(cli.notification_capacity));

    let firewall = Arc::new(FirewallService::new());

    let engine = {
        let on_allowed_firewall = firewall.clone();
        let on_denied_firewall = firewall.clone();
        LearningEngineBuilder::new(store.clone(), flow_cache.clone(), dns_cache.clone(), notifications.clone())
            .on_allowed(Box::new(move |flow| {
                let firewall = on_allowed_firewall.clone();
                tokio::spawn(async move {
                    firewall.enable_rule(&flow.id.to_string()).await;
                });
            }))
            .on_denied(Box::new(move |flow| {
                let firewall = on_denied_firewall.clone();
                tokio::spawn(async move {
                    firewall.disable_rule(&flow.id.to_string()).await;
                });
            }))
            .build()
    };
    let _engine_workers = engine.clone().spawn_workers(cli.flow_retention_days);

    spawn_dns_sweeper(dns_cache.clone());

    let log_reader = Arc::new(NfLogReader::new(netfilter::DEFAULT_RING_CAPACITY));
    spawn_log_reader(cli.nflog_group, log_reader.clone());
    spawn_sni_consumer(engine.clone(), log_reader.clone());

    let arp_cache = arp::spawn(ARP_REFRESH_INTERVAL);

    let queue_core = Arc::new(NfQueueCore::new(netfilter::DEFAULT_MAX_QUEUE_LEN, netfilter::DEFAULT_COPY_LEN));
    install_verdict_fn(&queue_core, engine.clone(), arp_cache);
    spawn_queue_reader(cli.nfqueue_num, queue_core.clone());

    let netlink = Arc::new(RtNetlink::new().context("failed to open netlink connection")?);
    let uplink_groups = Arc::new(HealthTrackingUplinkGroups::new());
    let uid_router = Arc::new(IpCommandUidRouter);

    let mut orchestrator = ServiceOrchestrator::new();
    orchestrator.register(services::FIREWALL_SERVICE, firewall.clone());
    let orchestrator = Arc::new(orchestrator);

    let scheduler = Arc::new(CronScheduler::new());
    let _scheduler_loop = {
        let firewall = firewall.clone();
        scheduler.clone().spawn_tick_loop(Duration::from_secs(1), move |action| {
            let firewall = firewall.clone();
            let action = action.clone();
            tokio::spawn(async move {
                match action {
                    config::TaskAction::EnableRule(id) => firewall.enable_rule(&id).await,
                    config::TaskAction::DisableRule(id) => firewall.disable_rule(&id).await,
                    config::TaskAction::RefreshIpSet(name) => firewall.refresh_ip_set(&name).await,
                }
            });
        })
    };

    let config_path = config_dir.join("config.json");
    let config_file = Arc::new(FileConfigHandle::open(&config_path).context("failed to open configuration file")?);
    let initial_config = load_initial_config(config_file.as_ref());

    let reload_coordinator = Arc::new(ReloadCoordinator::new(
        initial_config,
        netlink.clone(),
        netlink.clone(),
        netlink.clone(),
        netlink.clone(),
        uplink_groups.clone(),
        uid_router.clone(),
        orchestrator.clone(),
        scheduler.clone(),
    ));

    let safe_apply_snapshots = known_dirs::safe_apply_snapshots();
    if let Some(dir) = &safe_apply_snapshots {
        std::fs::create_dir_all(dir).ok();
    }
    let safe_apply_configurator = Arc::new(SafeInterfaceConfigurator::new(netlink.clone(), cli.safe_apply_interface.clone()));
    let safe_apply = Arc::new(SafeApplyManager::<SafeInterfaceConfigurator, InterfaceSnapshot>::new(
        safe_apply_configurator,
        Arc::new(DefaultConnectivityChecker),
    ));

    let app_state = Arc::new(handlers::AppState {
        engine: engine.clone(),
        store: store.clone(),
        notifications: notifications.clone(),
        reload: reload_coordinator.clone(),
        safe_apply,
        config_file: config_file.clone(),
        started_at: Instant::now(),
    });

    let mut rpc_server = RpcServer::new();
    handlers::register(&mut rpc_server, app_state.clone());
    let rpc_server = Arc::new(rpc_server);
    let listener = RpcServer::bind(&socket_path).context("failed to bind RPC socket")?;

    let cancel = CancellationToken::new();
    let serve_handle = tokio::spawn(rpc_server.clone().serve(listener, cancel.clone()));

    if let Err(error) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        tracing::debug!(%error, "sd_notify READY failed (not running under systemd?)");
    }

    run_until_shutdown(&reload_coordinator, &config_path, &cancel).await;

    cancel.cancel();
    let _ = serve_handle.await;
    tracing::info!("border-daemon stopped");
    Ok(())
}

/// Waits on SIGTERM/SIGINT to stop, or SIGHUP to re-read the configuration
/// file from disk and drive it through the reload coordinator.
async fn run_until_shutdown(reload: &Arc<ReloadCoordinator>, config_path: &std::path::Path, cancel: &CancellationToken) {
    let mut terminate = match signals::Terminate::new() {
        Ok(terminate) => terminate,
        Err(error) => {
            tracing::error!(%error, "failed to install termination signal handlers");
            return;
        }
    };
    let mut hangup = match signals::Hangup::new() {
        Ok(hangup) => hangup,
        Err(error) => {
            tracing::error!(%error, "failed to install SIGHUP handler");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = terminate.recv() => {
                tracing::info!("received termination signal, shutting down");
                return;
            }
            _ = hangup.recv() => {
                tracing::info!("received SIGHUP, reloading configuration from disk");
                let text = std::fs::read_to_string(config_path);
                let config = text.ok().and_then(|text| serde_json::from_str::<Config>(&text).ok()).unwrap_or_default();
                if let Err(error) = reload.reload(config).await {
                    tracing::error!(%error, "SIGHUP reload failed");
                }
            }
            () = cancel.cancelled() => {
                return;
            }
        }
    }
}

fn load_initial_config(config_file: &FileConfigHandle) -> Config {
    let text = config_file.get_raw_text();
    serde_json::from_str(&text).unwrap_or_default()
}

fn spawn_dns_sweeper(dns_cache: Arc<DnsCache>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(DNS_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let purged = dns_cache.sweep();
            if purged > 0 {
                tracing::debug!(purged, "swept expired DNS correlation entries");
            }
        }
    });
}

/// Feeds every NFLOG entry carrying an extracted SNI into the learning
/// engine's SNI-labelling path.
fn spawn_sni_consumer(engine: Arc<learning_engine::LearningEngine>, log_reader: Arc<NfLogReader>) {
    let mut rx = log_reader.subscribe();
    tokio::spawn(async move {
        while let Some(entry) = rx.recv().await {
            let Some(sni) = entry.sni else { continue };
            let Some(mac) = entry.src_mac else { continue };
            let (Some(src_ip), Some(dst_ip)) = (entry.packet.src_ip, entry.packet.dst_ip) else { continue };
            if let Err(error) = engine.process_sni(&mac.to_string(), &src_ip, &dst_ip, &sni).await {
                tracing::debug!(%error, "failed to record SNI observation");
            }
        }
    });
}

/// Bridges the synchronous NFQUEUE verdict callback to the async learning
/// engine: `block_in_place` moves the current task off the worker thread
/// pool's cooperative scheduling so `block_on` can drive it to completion
/// without starving other tasks, which requires the multi-thread runtime.
///
/// A packet whose source MAC the ARP cache hasn't resolved yet fails open
/// rather than making the kernel wait on an out-of-band lookup.
fn install_verdict_fn(queue_core: &Arc<NfQueueCore>, engine: Arc<learning_engine::LearningEngine>, arp_cache: Arc<arp::ArpCache>) {
    let runtime = tokio::runtime::Handle::current();
    queue_core.set_verdict_fn(Box::new(move |packet| {
        let Some(proto) = packet.protocol.clone() else { return true };
        let Some(port) = packet.dst_port else { return true };
        let Some(src_ip) = packet.src_ip.clone() else { return true };
        let Some(mac) = arp_cache.resolve(&src_ip) else { return true };

        let obs = Observation {
            mac,
            proto,
            port,
            src_ip: Some(src_ip),
            dst_ip: packet.dst_ip.clone(),
        };
        let engine = engine.clone();
        let runtime = runtime.clone();
        let outcome = tokio::task::block_in_place(move || runtime.block_on(engine.process_packet(obs)));
        match outcome {
            Ok(verdict) => verdict,
            Err(error) => {
                tracing::warn!(%error, "learning engine verdict lookup failed, failing open");
                true
            }
        }
    }));
}
