//! Service orchestration and configuration reload: the
//! ordered multi-service reload transaction, and the atomic re-derivation
//! of kernel state — routing, uplink groups, scheduled firewall rules, IP
//! sets, and services — from a newly installed configuration.

pub mod orchestrator;
pub mod reload;
pub mod scheduler;

pub use orchestrator::{ReloadAllResult, ServiceOrchestrator, FIREWALL_SERVICE};
pub use reload::{IpForwarding, MultiWanRouter, PolicyRouter, ReloadCoordinator, UidRouter, UplinkGroupManager};
pub use scheduler::CronScheduler;
