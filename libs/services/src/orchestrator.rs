//! Holds named long-lived services and reloads them in a defined order
//!: firewall first, because everything else depends on its rules
//! being current; every other service is then given a chance regardless of
//! whether an earlier one failed.

use config::{Config, ServiceHandle, ServiceStatus};
use std::collections::HashMap;
use std::sync::Arc;

pub const FIREWALL_SERVICE: &str = "firewall";

#[derive(Debug, Default)]
pub struct ReloadAllResult {
    pub success: bool,
    pub failed: HashMap<String, String>,
}

pub struct ServiceOrchestrator {
    services: HashMap<String, Arc<dyn ServiceHandle>>,
}

impl Default for ServiceOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceOrchestrator {
    pub fn new() -> Self {
        Self {
            services: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, service: Arc<dyn ServiceHandle>) {
        self.services.insert(name.into(), service);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ServiceHandle>> {
        self.services.get(name).cloned()
    }

    pub async fn status_of(&self, name: &str) -> Option<ServiceStatus> {
        match self.services.get(name) {
            Some(service) => Some(service.status().await),
            None => None,
        }
    }

    /// Reloads the firewall service first (any failure there is promoted
    /// to critical by the caller), then every other service regardless of
    /// what happened to the firewall — `reload_all` never aborts early.
    pub async fn reload_all(&self, config: &Config) -> ReloadAllResult {
        let mut failed = HashMap::new();

        if let Some(firewall) = self.services.get(FIREWALL_SERVICE) {
            if let Err(error) = firewall.reload(config).await {
                failed.insert(FIREWALL_SERVICE.to_string(), error.to_string());
            }
        }

        for (name, service) in &self.services {
            if name == FIREWALL_SERVICE {
                continue;
            }
            if let Err(error) = service.reload(config).await {
                failed.insert(name.clone(), error.to_string());
            }
        }

        ReloadAllResult {
            success: failed.is_empty(),
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct RecordingService {
        name: &'static str,
        order: Arc<StdMutex<Vec<&'static str>>>,
        fails: bool,
    }

    #[async_trait]
    impl ServiceHandle for RecordingService {
        async fn start(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn reload(&self, _config: &Config) -> anyhow::Result<bool> {
            self.order.lock().unwrap().push(self.name);
            if self.fails {
                anyhow::bail!("{} failed", self.name);
            }
            Ok(true)
        }
        async fn status(&self) -> ServiceStatus {
            ServiceStatus::default()
        }
    }

    #[tokio::test]
    async fn firewall_reloads_first_and_others_still_run_on_failure() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let mut orchestrator = ServiceOrchestrator::new();
        orchestrator.register(
            "dhcp",
            Arc::new(RecordingService {
                name: "dhcp",
                order: order.clone(),
                fails: false,
            }),
        );
        orchestrator.register(
            FIREWALL_SERVICE,
            Arc::new(RecordingService {
                name: "firewall",
                order: order.clone(),
                fails: true,
            }),
        );

        let result = orchestrator.reload_all(&Config::default()).await;
        assert!(!result.success);
        assert!(result.failed.contains_key(FIREWALL_SERVICE));
        assert_eq!(order.lock().unwrap()[0], "firewall");
        assert_eq!(order.lock().unwrap().len(), 2, "dhcp still got a chance despite firewall failing");
    }

    #[tokio::test]
    async fn all_succeed_reports_success() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let mut orchestrator = ServiceOrchestrator::new();
        orchestrator.register(
            FIREWALL_SERVICE,
            Arc::new(RecordingService {
                name: "firewall",
                order,
                fails: false,
            }),
        );

        let result = orchestrator.reload_all(&Config::default()).await;
        assert!(result.success);
        assert!(result.failed.is_empty());
    }
}
