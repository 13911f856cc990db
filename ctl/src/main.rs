#![expect(clippy::print_stdout, reason = "We are a CLI.")]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rpc::{methods, RpcClient};
use serde_json::{json, Value};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "borderctl", bin_name = "borderctl", about, long_about = None)]
struct Cli {
    /// Unix-domain socket the daemon's RPC server is listening on.
    #[arg(long, global = true, env = "BORDER_SOCKET_PATH")]
    socket_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print uptime, learning mode, flow counts, and any pending safe-apply.
    Status,
    /// Replace the daemon's configuration and drive it through a reload.
    ApplyConfig {
        /// Path to a JSON file holding the new configuration.
        path: PathBuf,
    },
    /// Inspect or act on learned flows.
    Flows {
        #[command(subcommand)]
        command: FlowsCommand,
    },
    /// Stage and roll back a network change with a connectivity check.
    SafeApply {
        #[command(subcommand)]
        command: SafeApplyCommand,
    },
    /// Read the notification feed.
    Notifications {
        /// Only return notifications with an id greater than this one.
        #[arg(long)]
        since: Option<u64>,
    },
    /// Verify and apply a staged binary upgrade.
    Upgrade {
        /// Path to the staged binary on disk.
        staged_path: String,
        /// Expected SHA-256 hex digest of the staged binary.
        expected_sha256: String,
    },
}

#[derive(Debug, Subcommand)]
enum FlowsCommand {
    /// List flows, optionally filtered by state or MAC address.
    List {
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        mac: Option<String>,
        #[arg(long)]
        order_by: Option<String>,
        #[arg(long)]
        order_dir: Option<String>,
        #[arg(long)]
        limit: Option<i64>,
        #[arg(long)]
        offset: Option<i64>,
    },
    /// Allow a pending flow and remember the decision.
    Approve { id: i64 },
    /// Deny a pending flow and remember the decision.
    Deny { id: i64 },
}

#[derive(Debug, Subcommand)]
enum SafeApplyCommand {
    /// Stage a network change, verify connectivity, and roll back on timeout.
    Interface {
        /// Address the new interface configuration should carry, as JSON.
        update_args: String,
        /// Address of the client issuing the change, for audit purposes.
        #[arg(long)]
        client_address: String,
        #[arg(long)]
        ping_target: Vec<String>,
        #[arg(long, default_value_t = 3)]
        ping_timeout_secs: u64,
        #[arg(long, default_value_t = 30)]
        rollback_delay_secs: u64,
        #[arg(long)]
        no_confirmation: bool,
    },
    /// Confirm a pending safe-apply change, cancelling its rollback timer.
    Confirm { id: String },
    /// Cancel a pending safe-apply change and roll it back immediately.
    Cancel { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let socket_path = cli.socket_path.unwrap_or_else(known_dirs::ipc_socket);
    let client = RpcClient::connect(socket_path).await.context("failed to connect to border-daemon")?;

    let reply = match cli.command {
        Command::Status => client.call(methods::GET_STATUS, Value::Null).await,
        Command::ApplyConfig { path } => {
            let text = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
            let config: Value = serde_json::from_str(&text).with_context(|| format!("{} is not valid JSON", path.display()))?;
            client.call(methods::APPLY_CONFIG, config).await
        }
        Command::Flows { command } => flows(&client, command).await,
        Command::SafeApply { command } => safe_apply(&client, command).await,
        Command::Notifications { since } => {
            client.call(methods::GET_NOTIFICATIONS, json!({ "since": since })).await
        }
        Command::Upgrade { staged_path, expected_sha256 } => {
            client
                .call(methods::UPGRADE, json!({ "staged_path": staged_path, "expected_sha256": expected_sha256 }))
                .await
        }
    }?;

    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}

async fn flows(client: &RpcClient, command: FlowsCommand) -> Result<Value> {
    match command {
        FlowsCommand::List { state, mac, order_by, order_dir, limit, offset } => {
            client
                .call(
                    methods::GET_FLOWS,
                    json!({
                        "state": state,
                        "mac": mac,
                        "order_by": order_by,
                        "order_dir": order_dir,
                        "limit": limit,
                        "offset": offset,
                    }),
                )
                .await
        }
        FlowsCommand::Approve { id } => client.call(methods::APPROVE_FLOW, json!({ "id": id })).await,
        FlowsCommand::Deny { id } => client.call(methods::DENY_FLOW, json!({ "id": id })).await,
    }
}

async fn safe_apply(client: &RpcClient, command: SafeApplyCommand) -> Result<Value> {
    match command {
        SafeApplyCommand::Interface {
            update_args,
            client_address,
            ping_target,
            ping_timeout_secs,
            rollback_delay_secs,
            no_confirmation,
        } => {
            let update_args: Value = serde_json::from_str(&update_args).context("update-args is not valid JSON")?;
            client
                .call(
                    methods::SAFE_APPLY_INTERFACE,
                    json!({
                        "update_args": update_args,
                        "client_address": client_address,
                        "ping_targets": ping_target,
                        "ping_timeout_secs": ping_timeout_secs,
                        "rollback_delay_secs": rollback_delay_secs,
                        "require_confirmation": !no_confirmation,
                    }),
                )
                .await
        }
        SafeApplyCommand::Confirm { id } => client.call(methods::CONFIRM_APPLY_INTERFACE, json!({ "id": id })).await,
        SafeApplyCommand::Cancel { id } => client.call(methods::CANCEL_APPLY_INTERFACE, json!({ "id": id })).await,
    }
}
