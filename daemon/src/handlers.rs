//! Typed RPC handlers registered against the `rpc::RpcServer`. Each handler
//! is a thin adapter between the wire's untyped JSON payload and one of the
//! core subsystems; business failures are reported back in the reply value
//! rather than as transport errors, per the error-handling design.

use crate::netlink::{InterfaceSnapshot, SafeInterfaceConfigurator};
use anyhow::{Context, Result};
use config::{Config, ConfigFile, FileConfigHandle};
use flow_store::model::{FlowState, ListOptions, OrderBy, OrderDir};
use flow_store::FlowStore;
use learning_engine::LearningEngine;
use notifications::NotificationHub;
use rpc::{methods, RpcServer};
use safe_apply::{SafeApplyManager, SafeConfig};
use serde::Deserialize;
use serde_json::{json, Value};
use services::ReloadCoordinator;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct AppState {
    pub engine: Arc<LearningEngine>,
    pub store: FlowStore,
    pub notifications: Arc<NotificationHub>,
    pub reload: Arc<ReloadCoordinator>,
    pub safe_apply: Arc<SafeApplyManager<SafeInterfaceConfigurator, InterfaceSnapshot>>,
    pub config_file: Arc<FileConfigHandle>,
    pub started_at: Instant,
}

/// Registers all ten operations the spec names against `server`.
pub fn register(server: &mut RpcServer, state: Arc<AppState>) {
    macro_rules! register {
        ($method:expr, $handler:expr) => {
            let state = state.clone();
            server.register($method, Arc::new(move |payload: Value| {
                let state = state.clone();
                async move { $handler(state, payload).await }
            }));
        };
    }

    register!(methods::GET_STATUS, get_status);
    register!(methods::APPLY_CONFIG, apply_config);
    register!(methods::GET_FLOWS, get_flows);
    register!(methods::APPROVE_FLOW, approve_flow);
    register!(methods::DENY_FLOW, deny_flow);
    register!(methods::SAFE_APPLY_INTERFACE, safe_apply_interface);
    register!(methods::CONFIRM_APPLY_INTERFACE, confirm_apply_interface);
    register!(methods::CANCEL_APPLY_INTERFACE, cancel_apply_interface);
    register!(methods::GET_NOTIFICATIONS, get_notifications);
    register!(methods::UPGRADE, upgrade);
}

async fn get_status(state: Arc<AppState>, _payload: Value) -> Result<Value> {
    let stats = state.store.get_stats().await?;
    let pending = state.safe_apply.get_pending().await;
    Ok(json!({
        "learning_mode": state.engine.learning_mode(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "flow_stats": stats,
        "notifications_last_id": state.notifications.last_id(),
        "safe_apply_pending": pending.map(|p| json!({"id": p.id, "client_address": p.client_address})),
    }))
}

async fn apply_config(state: Arc<AppState>, payload: Value) -> Result<Value> {
    let config: Config = match serde_json::from_value(payload) {
        Ok(config) => config,
        Err(error) => return Ok(json!({"success": false, "error": format!("invalid configuration: {error}")})),
    };

    match state.reload.reload(config.clone()).await {
        Ok(()) => {
            let rendered = serde_json::to_string_pretty(&config).unwrap_or_default();
            state.config_file.set_raw(rendered);
            if let Err(error) = state.config_file.save() {
                tracing::warn!(%error, "applied configuration but failed to persist it to disk");
            }
            Ok(json!({"success": true}))
        }
        Err(error) => Ok(json!({"success": false, "error": error.to_string()})),
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct GetFlowsArgs {
    state: Option<String>,
    mac: Option<String>,
    order_by: Option<String>,
    order_dir: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn get_flows(state: Arc<AppState>, payload: Value) -> Result<Value> {
    let args: GetFlowsArgs = if payload.is_null() { GetFlowsArgs::default() } else { serde_json::from_value(payload)? };

    let options = ListOptions {
        state: args.state.as_deref().and_then(FlowState::parse),
        mac: args.mac,
        order_by: args.order_by.as_deref().map(parse_order_by),
        order_dir: args.order_dir.as_deref().map(parse_order_dir),
        limit: args.limit,
        offset: args.offset,
    };

    let flows = state.store.list(options).await?;
    Ok(json!({"flows": flows}))
}

fn parse_order_by(s: &str) -> OrderBy {
    match s {
        "first_seen" => OrderBy::FirstSeen,
        "occurrences" => OrderBy::Occurrences,
        _ => OrderBy::LastSeen,
    }
}

fn parse_order_dir(s: &str) -> OrderDir {
    match s {
        "asc" => OrderDir::Asc,
        _ => OrderDir::Desc,
    }
}

#[derive(Deserialize)]
struct FlowIdArgs {
    id: i64,
}

async fn approve_flow(state: Arc<AppState>, payload: Value) -> Result<Value> {
    let args: FlowIdArgs = serde_json::from_value(payload)?;
    match state.engine.allow_flow(args.id).await {
        Ok(()) => Ok(json!({"success": true})),
        Err(error) => Ok(json!({"success": false, "error": error.to_string()})),
    }
}

async fn deny_flow(state: Arc<AppState>, payload: Value) -> Result<Value> {
    let args: FlowIdArgs = serde_json::from_value(payload)?;
    match state.engine.deny_flow(args.id).await {
        Ok(()) => Ok(json!({"success": true})),
        Err(error) => Ok(json!({"success": false, "error": error.to_string()})),
    }
}

#[derive(Deserialize)]
struct SafeApplyArgs {
    update_args: Value,
    client_address: String,
    #[serde(default)]
    ping_targets: Vec<String>,
    #[serde(default = "default_ping_timeout_secs")]
    ping_timeout_secs: u64,
    #[serde(default = "default_rollback_delay_secs")]
    rollback_delay_secs: u64,
    #[serde(default = "default_require_confirmation")]
    require_confirmation: bool,
}

fn default_ping_timeout_secs() -> u64 {
    3
}

fn default_rollback_delay_secs() -> u64 {
    30
}

fn default_require_confirmation() -> bool {
    true
}

async fn safe_apply_interface(state: Arc<AppState>, payload: Value) -> Result<Value> {
    let args: SafeApplyArgs = serde_json::from_value(payload)?;
    let safe_config = SafeConfig {
        ping_targets: args.ping_targets,
        ping_timeout: Duration::from_secs(args.ping_timeout_secs),
        rollback_delay: Duration::from_secs(args.rollback_delay_secs),
        require_confirmation: args.require_confirmation,
    };

    let outcome = state.safe_apply.apply(args.update_args, args.client_address, safe_config).await?;
    Ok(json!({"success": outcome.success, "message": outcome.message, "id": outcome.id}))
}

#[derive(Deserialize)]
struct PendingIdArgs {
    id: String,
}

async fn confirm_apply_interface(state: Arc<AppState>, payload: Value) -> Result<Value> {
    let args: PendingIdArgs = serde_json::from_value(payload)?;
    match state.safe_apply.confirm(&args.id).await {
        Ok(()) => Ok(json!({"success": true})),
        Err(error) => Ok(json!({"success": false, "error": error.to_string()})),
    }
}

async fn cancel_apply_interface(state: Arc<AppState>, payload: Value) -> Result<Value> {
    let args: PendingIdArgs = serde_json::from_value(payload)?;
    match state.safe_apply.cancel(&args.id).await {
        Ok(()) => Ok(json!({"success": true})),
        Err(error) => Ok(json!({"success": false, "error": error.to_string()})),
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct GetNotificationsArgs {
    since: Option<u64>,
}

async fn get_notifications(state: Arc<AppState>, payload: Value) -> Result<Value> {
    let args: GetNotificationsArgs = if payload.is_null() { GetNotificationsArgs::default() } else { serde_json::from_value(payload)? };
    let notifications = match args.since {
        Some(since) => state.notifications.get_since(since),
        None => state.notifications.get_all(),
    };
    Ok(json!({"notifications": notifications, "last_id": state.notifications.last_id()}))
}

#[derive(Deserialize)]
struct UpgradeArgs {
    staged_path: String,
    expected_sha256: String,
}

/// Verifies the staged binary's checksum before letting the unprivileged
/// peer swap it into place. A mismatch is promoted to an audit event and
/// the upgrade is refused outright — never applied "with a warning".
async fn upgrade(state: Arc<AppState>, payload: Value) -> Result<Value> {
    let args: UpgradeArgs = serde_json::from_value(payload)?;
    let path = args.staged_path.clone();
    let digest = tokio::task::spawn_blocking(move || -> Result<String> {
        let bytes = std::fs::read(&path).with_context(|| format!("failed to read staged binary {path}"))?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .context("checksum task panicked")??;

    if digest != args.expected_sha256 {
        state.notifications.publish(
            notifications::Severity::Error,
            "Upgrade refused",
            format!("staged binary {} checksum mismatch: expected {}, got {digest}", args.staged_path, args.expected_sha256),
        );
        return Ok(json!({"success": false, "error": "checksum mismatch, upgrade refused"}));
    }

    Ok(json!({"success": true}))
}
