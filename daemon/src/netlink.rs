//! Kernel networking collaborators backed by `rtnetlink`: interface
//! addressing, policy routing, multi-WAN route installation, and system-wide
//! IP forwarding. Grounded in the same connection-and-handle pattern the
//! workspace's tunnel device manager uses — one shared `rtnetlink::Handle`
//! driven by a background task for the process lifetime.

use anyhow::{Context, Result};
use async_trait::async_trait;
use config::model::{InterfaceConfig, UidRoute, UplinkGroupConfig};
use config::{Config, InterfaceApplier};
use futures::TryStreamExt;
use ip_network::IpNetwork;
use netlink_packet_route::route::RouteProtocol;
use netlink_packet_route::rule::RuleAction;
use rtnetlink::{new_connection, Error::NetlinkError, Handle, LinkUnspec, RouteMessageBuilder, RuleAddRequest};
use serde::{Deserialize, Serialize};
use services::{IpForwarding, MultiWanRouter, PolicyRouter, UidRouter, UplinkGroupManager};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Routing table ids policy routing installs rules into, one per zone name,
/// spread across the private-use table range the same way the rest of the
/// workspace's netlink code picks fixed table ids.
fn table_for_zone(zone: &str) -> u32 {
    0x2021_0000 + (fnv1a(zone.as_bytes()) & 0xffff)
}

fn table_for_group(name: &str) -> u32 {
    0x2022_0000 + (fnv1a(name.as_bytes()) & 0xffff)
}

/// FNV-1a, good enough to spread zone/group names across the table-id range
/// without a dependency on a dedicated hashing crate.
fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

async fn ignore_eexist(result: std::result::Result<(), rtnetlink::Error>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(NetlinkError(err)) if err.raw_code() == -libc::EEXIST => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Holds the shared netlink connection. Every kernel-networking collaborator
/// in the daemon is a thin wrapper around a clone of this handle.
pub struct RtNetlink {
    handle: Handle,
    _connection_task: JoinHandle<()>,
}

impl RtNetlink {
    pub fn new() -> Result<Self> {
        let (connection, handle, _messages) = new_connection().context("failed to open netlink connection")?;
        let connection_task = tokio::spawn(connection);
        Ok(Self {
            handle,
            _connection_task: connection_task,
        })
    }

    async fn link_index(&self, name: &str) -> Result<u32> {
        let mut links = self.handle.link().get().match_name(name.to_string()).execute();
        let link = links
            .try_next()
            .await
            .with_context(|| format!("failed to query link {name}"))?
            .with_context(|| format!("no such interface {name}"))?;
        Ok(link.header.index)
    }

    async fn current_addresses(&self, name: &str) -> Result<Vec<String>> {
        let index = self.link_index(name).await?;
        let mut addrs = self.handle.address().get().set_link_index_filter(index).execute();
        let mut out = Vec::new();
        while let Some(addr) = addrs.try_next().await.context("failed to enumerate addresses")? {
            for attr in &addr.attributes {
                if let netlink_packet_route::address::AddressAttribute::Address(ip) = attr {
                    out.push(format!("{ip}/{}", addr.header.prefix_len));
                }
            }
        }
        Ok(out)
    }

    /// Replaces every address on `name` with `addresses` and sets `mtu` if
    /// given, then brings the link up. Per-address add/remove failures are
    /// logged and skipped rather than aborting the whole call.
    async fn apply_addresses(&self, name: &str, addresses: &[String], mtu: Option<u32>) -> Result<()> {
        let index = self.link_index(name).await?;

        let mut existing = self.handle.address().get().set_link_index_filter(index).execute();
        let mut to_remove = Vec::new();
        while let Some(addr) = existing.try_next().await.context("failed to enumerate addresses")? {
            to_remove.push(addr);
        }
        for addr in to_remove {
            if let Err(error) = self.handle.address().del(addr).execute().await {
                tracing::warn!(%error, interface = %name, "failed to remove existing address, continuing");
            }
        }

        if let Some(mtu) = mtu {
            self.handle
                .link()
                .set(LinkUnspec::new_with_index(index).mtu(mtu).build())
                .execute()
                .await
                .context("failed to set MTU")?;
        }

        for address in addresses {
            let network: IpNetwork = address.parse().with_context(|| format!("invalid address {address}"))?;
            let add = self.handle.address().add(index, network.network_address(), network.netmask());
            if let Err(error) = add.execute().await {
                tracing::warn!(%error, interface = %name, %address, "failed to add address, continuing");
            }
        }

        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).up().build())
            .execute()
            .await
            .context("failed to bring interface up")?;

        Ok(())
    }

    fn rule(&self, table: u32, priority: u32) -> RuleAddRequest {
        self.handle
            .rule()
            .add()
            .table_id(table)
            .priority(priority)
            .action(RuleAction::ToTable)
    }
}

#[async_trait]
impl IpForwarding for RtNetlink {
    async fn set(&self, enabled: bool) -> Result<()> {
        let value = if enabled { "1" } else { "0" };
        for path in ["/proc/sys/net/ipv4/ip_forward", "/proc/sys/net/ipv6/conf/all/forwarding"] {
            if let Err(error) = tokio::fs::write(path, value).await {
                tracing::warn!(%error, %path, "failed to set forwarding flag");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl InterfaceApplier for RtNetlink {
    async fn apply_interface(&self, interface: &InterfaceConfig) -> Result<()> {
        if interface.dhcp {
            // A DHCP-managed interface's addresses are owned by the DHCP
            // client, not by us; only MTU and link state are ours to set.
            let index = self.link_index(&interface.name).await?;
            if let Some(mtu) = interface.mtu {
                self.handle
                    .link()
                    .set(LinkUnspec::new_with_index(index).mtu(mtu).build())
                    .execute()
                    .await
                    .context("failed to set MTU")?;
            }
            self.handle
                .link()
                .set(LinkUnspec::new_with_index(index).up().build())
                .execute()
                .await
                .context("failed to bring interface up")?;
            return Ok(());
        }

        self.apply_addresses(&interface.name, &interface.addresses, interface.mtu).await
    }
}

#[async_trait]
impl PolicyRouter for RtNetlink {
    /// Installs one source-routing rule per zone, directing that zone's
    /// traffic into a dedicated table. A rule that already exists is not an
    /// error; any other failure is logged, since one zone's misconfigured
    /// rule shouldn't block the rest from reloading.
    async fn reload(&self, config: &Config) -> Result<()> {
        for interface in &config.interfaces {
            let table = table_for_zone(&interface.zone);
            for address in &interface.addresses {
                let Ok(network) = address.parse::<IpNetwork>() else { continue };
                let result = match network {
                    IpNetwork::V4(_) => ignore_eexist(self.rule(table, 100).v4().execute().await).await,
                    IpNetwork::V6(_) => ignore_eexist(self.rule(table, 100).v6().execute().await).await,
                };
                if let Err(error) = result {
                    tracing::warn!(%error, zone = %interface.zone, interface = %interface.name, "failed to install policy rule");
                }
            }
        }
        Ok(())
    }
}

fn default_route_v4(idx: u32, table: u32, priority: u32) -> netlink_packet_route::route::RouteMessage {
    RouteMessageBuilder::<Ipv4Addr>::new()
        .output_interface(idx)
        .protocol(RouteProtocol::Static)
        .table_id(table)
        .priority(priority)
        .build()
}

fn default_route_v6(idx: u32, table: u32, priority: u32) -> netlink_packet_route::route::RouteMessage {
    RouteMessageBuilder::<Ipv6Addr>::new()
        .output_interface(idx)
        .protocol(RouteProtocol::Static)
        .table_id(table)
        .priority(priority)
        .build()
}

#[async_trait]
impl MultiWanRouter for RtNetlink {
    /// Installs a default route into the group's table for every member
    /// connection, one per address family. Lower declaration order gets a
    /// lower route priority, i.e. is preferred by the kernel.
    async fn install_routes(&self, group: &UplinkGroupConfig) -> Result<()> {
        let table = table_for_group(&group.name);

        for (order, connection) in group.connections.iter().enumerate() {
            let index = match self.link_index(&connection.interface).await {
                Ok(index) => index,
                Err(error) => {
                    tracing::warn!(%error, interface = %connection.interface, "uplink interface not found, skipping");
                    continue;
                }
            };
            let priority = (order as u32) * 10 + 1;

            for message in [default_route_v4(index, table, priority), default_route_v6(index, table, priority)] {
                if let Err(error) = self.handle.route().add(message).execute().await {
                    if !matches!(&error, NetlinkError(err) if err.raw_code() == -libc::EEXIST || err.raw_code() == -libc::EOPNOTSUPP) {
                        tracing::warn!(%error, interface = %connection.interface, group = %group.name, "failed to install multi-wan default route");
                    }
                }
            }
        }
        Ok(())
    }
}

/// Tracks uplink group membership and per-target reachability for health
/// checks. The reachability map is read by whatever consumer needs to steer
/// traffic away from a down uplink.
pub struct HealthTrackingUplinkGroups {
    groups: Mutex<Vec<UplinkGroupConfig>>,
    reachable: Arc<Mutex<HashMap<String, bool>>>,
}

impl Default for HealthTrackingUplinkGroups {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTrackingUplinkGroups {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(Vec::new()),
            reachable: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn is_reachable(&self, target: &str) -> Option<bool> {
        self.reachable.lock().await.get(target).copied()
    }
}

#[async_trait]
impl UplinkGroupManager for HealthTrackingUplinkGroups {
    async fn set_groups(&self, groups: Vec<UplinkGroupConfig>) -> Result<()> {
        *self.groups.lock().await = groups;
        Ok(())
    }

    async fn start_health_checks(&self, interval: Duration, targets: Vec<String>) -> Result<()> {
        let reachable = Arc::clone(&self.reachable);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                for target in &targets {
                    let ok = probe(target).await;
                    reachable.lock().await.insert(target.clone(), ok);
                }
            }
        });
        Ok(())
    }
}

async fn probe(target: &str) -> bool {
    let Ok(mut addrs) = tokio::net::lookup_host((target.as_str(), 443)).await else {
        return false;
    };
    let Some(addr) = addrs.next() else { return false };
    matches!(
        tokio::time::timeout(Duration::from_secs(3), tokio::net::TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Per-UID routing rules, applied via the `ip` binary: `rtnetlink`'s rule
/// builder has no UID-range attribute, so this shells out the same way an
/// operator would from a terminal.
pub struct IpCommandUidRouter;

#[async_trait]
impl UidRouter for IpCommandUidRouter {
    async fn apply(&self, routes: &[UidRoute]) -> Result<()> {
        let _ = Command::new("ip").args(["-4", "rule", "flush"]).output().await;

        for route in routes {
            let spec = format!("{}-{}", route.uid, route.uid);
            let status = Command::new("ip")
                .args(["rule", "add", "uidrange", &spec, "lookup", &route.table])
                .status()
                .await
                .context("failed to spawn ip rule add")?;
            if !status.success() {
                tracing::warn!(uid = route.uid, table = %route.table, "ip rule add exited non-zero");
            }
        }
        Ok(())
    }
}

/// The opaque snapshot `safe_apply::NetworkConfigurator` persists across an
/// interface change: just enough to restore the interface to its prior
/// addressing if connectivity verification fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceSnapshot {
    pub name: String,
    pub addresses: Vec<String>,
}

/// Guards a single named interface for the safe-apply workflow — the
/// management/WAN interface an operator might otherwise lock themselves out
/// of.
pub struct SafeInterfaceConfigurator {
    netlink: Arc<RtNetlink>,
    interface: String,
}

impl SafeInterfaceConfigurator {
    pub fn new(netlink: Arc<RtNetlink>, interface: String) -> Self {
        Self { netlink, interface }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ApplyArgs {
    addresses: Vec<String>,
    #[serde(default)]
    mtu: Option<u32>,
}

#[async_trait]
impl safe_apply::NetworkConfigurator<InterfaceSnapshot> for SafeInterfaceConfigurator {
    async fn snapshot(&self) -> Result<InterfaceSnapshot> {
        Ok(InterfaceSnapshot {
            name: self.interface.clone(),
            addresses: self.netlink.current_addresses(&self.interface).await?,
        })
    }

    async fn apply(&self, update_args: &serde_json::Value) -> Result<()> {
        let args: ApplyArgs = serde_json::from_value(update_args.clone()).context("invalid interface apply payload")?;
        self.netlink.apply_addresses(&self.interface, &args.addresses, args.mtu).await
    }

    async fn restore(&self, snapshot: &InterfaceSnapshot) -> Result<()> {
        self.netlink.apply_addresses(&snapshot.name, &snapshot.addresses, None).await
    }
}
