//! The in-memory configuration object the reload coordinator re-derives
//! kernel state from.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BondMode {
    ActiveBackup,
    Lacp,
    RoundRobin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BondShape {
    pub mode: BondMode,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VlanShape {
    pub parent: String,
    pub tag: u16,
}

/// An interface plus its address list, DHCP flag, MTU, zone assignment,
/// and optional bond/VLAN shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub name: String,
    pub addresses: Vec<String>,
    pub dhcp: bool,
    pub mtu: Option<u32>,
    pub zone: String,
    pub bond: Option<BondShape>,
    pub vlan: Option<VlanShape>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallRule {
    pub id: String,
    pub enabled: bool,
    pub body: serde_json::Value,
}

/// A firewall rule whose installation is gated by a cron schedule rather
/// than being always-on. `end_schedule` is optional; when
/// present the reload coordinator also schedules a task that removes the
/// rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledRule {
    pub id: String,
    pub enabled: bool,
    pub schedule: String,
    pub end_schedule: Option<String>,
    pub rule: FirewallRule,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpSetConfig {
    pub name: String,
    pub auto_update: bool,
    /// Seconds between refreshes. `0` disables the refresh task even if
    /// `auto_update` is set.
    pub refresh_interval_secs: u64,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkConnection {
    pub name: String,
    pub interface: String,
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiWanConfig {
    pub enabled: bool,
    pub connections: Vec<UplinkConnection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkGroupConfig {
    pub name: String,
    pub connections: Vec<UplinkConnection>,
    pub health_check_interval_secs: u64,
    pub health_check_targets: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesConfig {
    pub firewall_enabled: bool,
    pub dhcp_enabled: bool,
    pub dns_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpScope {
    pub interface: String,
    pub range_start: String,
    pub range_end: String,
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UidRoute {
    pub uid: u32,
    pub table: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub ip_forwarding: bool,
    /// Whether the unprivileged API process is running inside its
    /// sandbox. When true the reload coordinator forces IP forwarding on
    /// regardless of `ip_forwarding`.
    pub api_sandbox_active: bool,
    pub interfaces: Vec<InterfaceConfig>,
    pub firewall_rules: Vec<FirewallRule>,
    pub scheduled_rules: Vec<ScheduledRule>,
    pub ip_sets: Vec<IpSetConfig>,
    pub multi_wan: Option<MultiWanConfig>,
    pub uplink_groups: Vec<UplinkGroupConfig>,
    pub services: ServicesConfig,
    pub dhcp_scopes: Vec<DhcpScope>,
    pub uid_routes: Vec<UidRoute>,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            addresses: Vec::new(),
            dhcp: false,
            mtu: None,
            zone: "lan".to_string(),
            bond: None,
            vlan: None,
        }
    }
}
