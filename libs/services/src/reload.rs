//! Transactional re-derivation of kernel state from a new configuration
//!. Runs under an exclusive configuration lock; installs the new
//! configuration pointer first so any reader that acquires the lock after
//! us sees the new values, then works through interfaces, policy routing,
//! multi-WAN, uplink groups, services, and the two scheduler syncs in the
//! order the spec fixes.

use crate::orchestrator::ServiceOrchestrator;
use async_trait::async_trait;
use config::{Config, TaskAction, TaskScheduler};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

pub const MULTI_WAN_GROUP_NAME: &str = "multi_wan";

/// Sets the system-wide IP forwarding flag.
#[async_trait]
pub trait IpForwarding: Send + Sync {
    async fn set(&self, enabled: bool) -> anyhow::Result<()>;
}

/// Reloads policy routing tables from the current configuration.
#[async_trait]
pub trait PolicyRouter: Send + Sync {
    async fn reload(&self, config: &Config) -> anyhow::Result<()>;
}

/// Installs routes for a synthesised or configured multi-WAN uplink group
///.
#[async_trait]
pub trait MultiWanRouter: Send + Sync {
    async fn install_routes(&self, group: &config::model::UplinkGroupConfig) -> anyhow::Result<()>;
}

/// (Re-)starts health checking for the configured uplink groups.
#[async_trait]
pub trait UplinkGroupManager: Send + Sync {
    async fn set_groups(&self, groups: Vec<config::model::UplinkGroupConfig>) -> anyhow::Result<()>;
    async fn start_health_checks(&self, interval: Duration, targets: Vec<String>) -> anyhow::Result<()>;
}

/// Applies per-UID routing rules.
#[async_trait]
pub trait UidRouter: Send + Sync {
    async fn apply(&self, routes: &[config::model::UidRoute]) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct ReloadErrors {
    pub critical: Vec<(String, String)>,
}

impl ReloadErrors {
    fn push(&mut self, subsystem: &str, error: impl std::fmt::Display) {
        self.critical.push((subsystem.to_string(), error.to_string()));
    }

    fn into_result(self) -> anyhow::Result<()> {
        if self.critical.is_empty() {
            return Ok(());
        }
        let joined = self
            .critical
            .iter()
            .map(|(subsystem, error)| format!("{subsystem}: {error}"))
            .collect::<Vec<_>>()
            .join("; ");
        Err(anyhow::anyhow!("reload failed: {joined}"))
    }
}

pub struct ReloadCoordinator {
    config: RwLock<Arc<Config>>,
    ip_forwarding: Arc<dyn IpForwarding>,
    interfaces: Arc<dyn config::InterfaceApplier>,
    policy_router: Arc<dyn PolicyRouter>,
    multi_wan_router: Arc<dyn MultiWanRouter>,
    uplink_groups: Arc<dyn UplinkGroupManager>,
    uid_router: Arc<dyn UidRouter>,
    orchestrator: Arc<ServiceOrchestrator>,
    scheduler: Arc<dyn TaskScheduler>,
}

impl ReloadCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        initial: Config,
        ip_forwarding: Arc<dyn IpForwarding>,
        interfaces: Arc<dyn config::InterfaceApplier>,
        policy_router: Arc<dyn PolicyRouter>,
        multi_wan_router: Arc<dyn MultiWanRouter>,
        uplink_groups: Arc<dyn UplinkGroupManager>,
        uid_router: Arc<dyn UidRouter>,
        orchestrator: Arc<ServiceOrchestrator>,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Self {
        Self {
            config: RwLock::new(Arc::new(initial)),
            ip_forwarding,
            interfaces,
            policy_router,
            multi_wan_router,
            uplink_groups,
            uid_router,
            orchestrator,
            scheduler,
        }
    }

    pub async fn current_config(&self) -> Arc<Config> {
        self.config.read().await.clone()
    }

    /// Executes the full reload under the exclusive configuration lock.
    /// Returns `Err` naming every failing *critical* subsystem; per-
    /// interface and per-service failures are logged but don't fail the
    /// reload.
    pub async fn reload(&self, new_config: Config) -> anyhow::Result<()> {
        let mut guard = self.config.write().await;
        let new_config = Arc::new(new_config);

        // 1. Install the new configuration pointer.
        *guard = new_config.clone();
        let config = new_config;

        let mut errors = ReloadErrors::default();

        // 2. IP forwarding, forced on when the API sandbox is active.
        let want_forwarding = config.ip_forwarding || config.api_sandbox_active;
        if let Err(error) = self.ip_forwarding.set(want_forwarding).await {
            errors.push("ip-forwarding", error);
        }

        // 3. Apply each interface. Non-critical: log and continue.
        for interface in &config.interfaces {
            if let Err(error) = self.interfaces.apply_interface(interface).await {
                tracing::error!(%error, interface = %interface.name, "failed to apply interface, continuing");
            }
        }

        // 4. Reload policy routing (critical).
        if let Err(error) = self.policy_router.reload(&config).await {
            errors.push("policy-routing", error);
        }

        // 5. Multi-WAN routes, synthesising an uplink group named
        // `multi_wan` from its connections when enabled.
        if let Some(multi_wan) = &config.multi_wan {
            if multi_wan.enabled {
                let group = config::model::UplinkGroupConfig {
                    name: MULTI_WAN_GROUP_NAME.to_string(),
                    connections: multi_wan.connections.clone(),
                    health_check_interval_secs: 0,
                    health_check_targets: Vec::new(),
                };
                if let Err(error) = self.multi_wan_router.install_routes(&group).await {
                    errors.push("multi-wan", error);
                }
            }
        }

        // 6. Reload uplink groups, (re-)starting health checking.
        if let Err(error) = self.uplink_groups.set_groups(config.uplink_groups.clone()).await {
            errors.push("uplink-groups", error);
        }
        for group in &config.uplink_groups {
            if group.health_check_interval_secs > 0 {
                if let Err(error) = self
                    .uplink_groups
                    .start_health_checks(
                        Duration::from_secs(group.health_check_interval_secs),
                        group.health_check_targets.clone(),
                    )
                    .await
                {
                    tracing::warn!(%error, group = %group.name, "failed to start health checks");
                }
            }
        }

        // 7. reload-all; firewall failures are critical.
        let result = self.orchestrator.reload_all(&config).await;
        if let Some(firewall_error) = result.failed.get(crate::orchestrator::FIREWALL_SERVICE) {
            errors.push("firewall", firewall_error);
        }
        for (name, error) in &result.failed {
            if name != crate::orchestrator::FIREWALL_SERVICE {
                tracing::error!(service = %name, %error, "service reload failed");
            }
        }

        // 8. Sync scheduled firewall rule tasks.
        self.scheduler.remove_tasks_with_prefix("rule_");
        for rule in &config.scheduled_rules {
            if !rule.enabled {
                continue;
            }
            self.scheduler.add_task(
                format!("rule_{}_start", rule.id),
                rule.schedule.clone(),
                TaskAction::EnableRule(rule.id.clone()),
            );
            if let Some(end_schedule) = &rule.end_schedule {
                self.scheduler.add_task(
                    format!("rule_{}_end", rule.id),
                    end_schedule.clone(),
                    TaskAction::DisableRule(rule.id.clone()),
                );
            }
        }

        // 9. Sync IP-set refresh tasks.
        self.scheduler.remove_tasks_with_prefix("ipset_");
        for ip_set in &config.ip_sets {
            if ip_set.auto_update && ip_set.refresh_interval_secs > 0 {
                self.scheduler.add_task(
                    format!("ipset_{}", ip_set.name),
                    seconds_to_cron(ip_set.refresh_interval_secs),
                    TaskAction::RefreshIpSet(ip_set.name.clone()),
                );
            }
        }

        // 10. Apply per-UID routing.
        if let Err(error) = self.uid_router.apply(&config.uid_routes).await {
            errors.push("uid-routing", error);
        }

        errors.into_result()
    }
}

/// The scheduler only understands cron expressions; an interval in seconds
/// is expressed as `every N seconds` via a seconds-field step, clamped to
/// a sane minimum of 1s.
fn seconds_to_cron(interval_secs: u64) -> String {
    let step = interval_secs.max(1);
    format!("0/{step} * * * * *")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::CronScheduler;
    use config::model::*;
    use std::sync::Mutex as StdMutex;

    struct AlwaysOk;
    #[async_trait]
    impl IpForwarding for AlwaysOk {
        async fn set(&self, _enabled: bool) -> anyhow::Result<()> {
            Ok(())
        }
    }
    #[async_trait]
    impl config::InterfaceApplier for AlwaysOk {
        async fn apply_interface(&self, _interface: &InterfaceConfig) -> anyhow::Result<()> {
            Ok(())
        }
    }
    #[async_trait]
    impl PolicyRouter for AlwaysOk {
        async fn reload(&self, _config: &Config) -> anyhow::Result<()> {
            Ok(())
        }
    }
    #[async_trait]
    impl MultiWanRouter for AlwaysOk {
        async fn install_routes(&self, _group: &UplinkGroupConfig) -> anyhow::Result<()> {
            Ok(())
        }
    }
    #[async_trait]
    impl UplinkGroupManager for AlwaysOk {
        async fn set_groups(&self, _groups: Vec<UplinkGroupConfig>) -> anyhow::Result<()> {
            Ok(())
        }
        async fn start_health_checks(&self, _interval: Duration, _targets: Vec<String>) -> anyhow::Result<()> {
            Ok(())
        }
    }
    #[async_trait]
    impl UidRouter for AlwaysOk {
        async fn apply(&self, _routes: &[UidRoute]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct FailingPolicyRouter;
    #[async_trait]
    impl PolicyRouter for FailingPolicyRouter {
        async fn reload(&self, _config: &Config) -> anyhow::Result<()> {
            anyhow::bail!("netlink error")
        }
    }

    fn coordinator_with(policy_router: Arc<dyn PolicyRouter>) -> ReloadCoordinator {
        let ok = Arc::new(AlwaysOk);
        ReloadCoordinator::new(
            Config::default(),
            ok.clone(),
            ok.clone(),
            policy_router,
            ok.clone(),
            ok.clone(),
            ok.clone(),
            Arc::new(ServiceOrchestrator::new()),
            Arc::new(CronScheduler::new()),
        )
    }

    #[tokio::test]
    async fn critical_policy_routing_failure_is_aggregated() {
        let coordinator = coordinator_with(Arc::new(FailingPolicyRouter));
        let result = coordinator.reload(Config::default()).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("policy-routing"));
    }

    #[tokio::test]
    async fn new_config_pointer_installed_even_on_critical_failure() {
        let coordinator = coordinator_with(Arc::new(FailingPolicyRouter));
        let mut config = Config::default();
        config.ip_forwarding = true;
        let _ = coordinator.reload(config).await;
        assert!(coordinator.current_config().await.ip_forwarding);
    }

    #[tokio::test]
    async fn scheduled_rule_tasks_synced_after_reload() {
        let scheduler = Arc::new(CronScheduler::new());
        let ok = Arc::new(AlwaysOk);
        let coordinator = ReloadCoordinator::new(
            Config::default(),
            ok.clone(),
            ok.clone(),
            ok.clone(),
            ok.clone(),
            ok.clone(),
            ok.clone(),
            Arc::new(ServiceOrchestrator::new()),
            scheduler.clone(),
        );

        let mut config = Config::default();
        config.scheduled_rules.push(ScheduledRule {
            id: "guest-wifi-curfew".to_string(),
            enabled: true,
            schedule: "0 0 22 * * *".to_string(),
            end_schedule: Some("0 0 6 * * *".to_string()),
            rule: FirewallRule {
                id: "guest-wifi-curfew".to_string(),
                enabled: true,
                body: serde_json::json!({}),
            },
        });
        config.ip_sets.push(IpSetConfig {
            name: "threat-feed".to_string(),
            auto_update: true,
            refresh_interval_secs: 3600,
            members: vec![],
        });

        coordinator.reload(config).await.unwrap();

        let tasks = scheduler.list_tasks();
        assert!(tasks.iter().any(|t| t.id == "rule_guest-wifi-curfew_start"));
        assert!(tasks.iter().any(|t| t.id == "rule_guest-wifi-curfew_end"));
        assert!(tasks.iter().any(|t| t.id == "ipset_threat-feed"));
    }

    #[tokio::test]
    async fn multi_wan_synthesises_named_group_when_enabled() {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        struct Recording(Arc<StdMutex<Vec<String>>>);
        #[async_trait]
        impl MultiWanRouter for Recording {
            async fn install_routes(&self, group: &UplinkGroupConfig) -> anyhow::Result<()> {
                self.0.lock().unwrap().push(group.name.clone());
                Ok(())
            }
        }
        let ok = Arc::new(AlwaysOk);
        let coordinator = ReloadCoordinator::new(
            Config::default(),
            ok.clone(),
            ok.clone(),
            ok.clone(),
            Arc::new(Recording(calls.clone())),
            ok.clone(),
            ok.clone(),
            Arc::new(ServiceOrchestrator::new()),
            Arc::new(CronScheduler::new()),
        );

        let mut config = Config::default();
        config.multi_wan = Some(MultiWanConfig {
            enabled: true,
            connections: vec![UplinkConnection {
                name: "wan1".to_string(),
                interface: "eth0".to_string(),
                weight: 1,
            }],
        });
        coordinator.reload(config).await.unwrap();

        assert_eq!(calls.lock().unwrap().as_slice(), [MULTI_WAN_GROUP_NAME.to_string()]);
    }
}
