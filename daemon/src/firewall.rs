//! The `firewall` service the orchestrator reloads first: renders the
//! configured rules and IP sets into an `nft` ruleset and loads it the same
//! way an operator would from a terminal, via `nft -f -` on stdin. Enable/
//! disable and IP-set refresh tasks fired by the cron scheduler mutate the
//! in-memory rule set and reapply the whole table, since `nft` has no
//! notion of toggling a single rule in place.

use anyhow::{Context, Result};
use async_trait::async_trait;
use config::model::{FirewallRule, IpSetConfig};
use config::{Config, ServiceHandle, ServiceStatus};
use std::collections::HashSet;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;

const TABLE_NAME: &str = "border_fw";

/// A firewall rule's `body` is an opaque JSON value; the only shape this
/// driver understands is `{"nft": "<rule fragment>"}`.
fn parse_fragment(body: &serde_json::Value) -> Option<String> {
    body.get("nft").and_then(|v| v.as_str()).map(str::to_string)
}

#[derive(Default)]
struct State {
    rules: Vec<FirewallRule>,
    ip_sets: Vec<IpSetConfig>,
    disabled: HashSet<String>,
    last_error: Option<String>,
}

/// Applies firewall rules and IP sets via the `nft` binary. Owns no kernel
/// resources directly — every apply is a full `nft -f -` reload of
/// `inet border_fw`, so a disabled rule simply isn't rendered into the
/// next script.
pub struct FirewallService {
    state: Mutex<State>,
}

impl Default for FirewallService {
    fn default() -> Self {
        Self::new()
    }
}

impl FirewallService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    pub async fn enable_rule(&self, id: &str) {
        let mut state = self.state.lock().await;
        state.disabled.remove(id);
        drop(state);
        if let Err(error) = self.apply_locked().await {
            tracing::error!(%error, rule = %id, "failed to re-apply after enabling rule");
        }
    }

    pub async fn disable_rule(&self, id: &str) {
        let mut state = self.state.lock().await;
        state.disabled.insert(id.to_string());
        drop(state);
        if let Err(error) = self.apply_locked().await {
            tracing::error!(%error, rule = %id, "failed to re-apply after disabling rule");
        }
    }

    /// Dynamic members of an IP set (threat feeds, geo lists) are resolved
    /// by a collaborator this workspace doesn't implement; re-applying the
    /// statically configured members is the whole of what we can do here.
    pub async fn refresh_ip_set(&self, name: &str) {
        tracing::info!(ip_set = %name, "refreshing ip set from configured members");
        if let Err(error) = self.apply_locked().await {
            tracing::error!(%error, ip_set = %name, "failed to re-apply after ip set refresh");
        }
    }

    async fn apply_locked(&self) -> Result<()> {
        let state = self.state.lock().await;
        let script = render_ruleset(&state.rules, &state.ip_sets, &state.disabled);
        drop(state);
        load_ruleset(&script).await
    }
}

#[async_trait]
impl ServiceHandle for FirewallService {
    async fn start(&self) -> Result<()> {
        self.apply_locked().await
    }

    async fn stop(&self) -> Result<()> {
        let status = Command::new("nft")
            .args(["delete", "table", "inet", TABLE_NAME])
            .status()
            .await
            .context("failed to spawn nft delete table")?;
        if !status.success() {
            tracing::debug!("nft delete table exited non-zero, table likely didn't exist");
        }
        Ok(())
    }

    async fn reload(&self, config: &Config) -> Result<bool> {
        let mut state = self.state.lock().await;
        let changed = rules_changed(&state.rules, &config.firewall_rules) || ip_sets_changed(&state.ip_sets, &config.ip_sets);
        state.rules = config.firewall_rules.clone();
        state.ip_sets = config.ip_sets.clone();
        let script = render_ruleset(&state.rules, &state.ip_sets, &state.disabled);
        drop(state);

        match load_ruleset(&script).await {
            Ok(()) => {
                self.state.lock().await.last_error = None;
                Ok(changed)
            }
            Err(error) => {
                self.state.lock().await.last_error = Some(error.to_string());
                Err(error)
            }
        }
    }

    async fn status(&self) -> ServiceStatus {
        let state = self.state.lock().await;
        ServiceStatus {
            running: true,
            error: state.last_error.clone(),
        }
    }
}

fn rules_changed(old: &[FirewallRule], new: &[FirewallRule]) -> bool {
    old.len() != new.len() || old.iter().zip(new).any(|(a, b)| a.id != b.id || a.enabled != b.enabled || a.body != b.body)
}

fn ip_sets_changed(old: &[IpSetConfig], new: &[IpSetConfig]) -> bool {
    old.len() != new.len() || old.iter().zip(new).any(|(a, b)| a.name != b.name || a.members != b.members)
}

fn render_ruleset(rules: &[FirewallRule], ip_sets: &[IpSetConfig], disabled: &HashSet<String>) -> String {
    let mut out = String::new();
    out.push_str(&format!("table inet {TABLE_NAME} {{\n"));

    for set in ip_sets {
        out.push_str(&format!("  set {} {{\n    type ipv4_addr\n    flags interval\n", set.name));
        if !set.members.is_empty() {
            out.push_str(&format!("    elements = {{ {} }}\n", set.members.join(", ")));
        }
        out.push_str("  }\n\n");
    }

    out.push_str("  chain input {\n    type filter hook input priority 0; policy accept;\n");
    for rule in rules {
        if !rule.enabled || disabled.contains(&rule.id) {
            continue;
        }
        let Some(fragment) = parse_fragment(&rule.body) else {
            tracing::warn!(rule = %rule.id, "firewall rule body missing an \"nft\" fragment, skipping");
            continue;
        };
        out.push_str(&format!("    {fragment}\n"));
    }
    out.push_str("  }\n");
    out.push_str("}\n");
    out
}

async fn load_ruleset(script: &str) -> Result<()> {
    let mut child = Command::new("nft")
        .args(["-f", "-"])
        .stdin(std::process::Stdio::piped())
        .spawn()
        .context("failed to spawn nft")?;

    let mut stdin = child.stdin.take().context("nft child has no stdin")?;
    stdin.write_all(script.as_bytes()).await.context("failed to write ruleset to nft")?;
    drop(stdin);

    let status = child.wait().await.context("failed waiting for nft")?;
    if !status.success() {
        anyhow::bail!("nft -f - exited with {status}");
    }
    Ok(())
}
