//! The configuration boundary: the in-memory `Config` the reload
//! coordinator re-derives kernel state from, plus the external collaborator
//! traits the core drives but does not implement itself — the HCL-backed
//! config file, the network configurator, the task scheduler, and a named
//! service handle.

pub mod model;

pub use model::Config;

use async_trait::async_trait;
use std::collections::HashMap;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("no section of type {0:?} with labels {1:?}")]
    NoSuchSection(String, Vec<String>),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: DiagnosticSeverity,
    pub message: String,
    pub line: Option<u32>,
}

/// The opaque "configuration file" handle. The core never parses
/// the configuration language itself; it only calls through
/// this interface. `FileConfigHandle` below is a plain-text stand-in
/// sufficient to drive the reload coordinator and its tests — the real
/// HCL-backed implementation is an external collaborator.
pub trait ConfigFile: Send + Sync {
    fn get_raw_text(&self) -> String;
    fn get_section(&self, section_type: &str, labels: &[String]) -> Option<String>;
    fn set_section(&self, section_type: &str, labels: &[String], body: String);
    fn set_raw(&self, text: String);
    fn remove_section(&self, section_type: &str, labels: &[String]) -> bool;
    fn validate(&self, text: &str) -> Vec<Diagnostic>;
    fn save(&self) -> anyhow::Result<()>;
    /// Textual diff between the in-memory buffer and what's on disk.
    fn diff_against_disk(&self) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SectionKey {
    section_type: String,
    labels: Vec<String>,
}

/// A plain-text-backed `ConfigFile`. Sections are tracked as `type+labels
/// -> body` pairs and rendered back into `type "label" { body }` blocks on
/// `get_raw_text`/`save` — enough structure to exercise the reload
/// coordinator without depending on the real HCL parser (out of scope).
pub struct FileConfigHandle {
    path: std::path::PathBuf,
    sections: parking_lot::Mutex<HashMap<SectionKey, String>>,
    order: parking_lot::Mutex<Vec<SectionKey>>,
}

impl FileConfigHandle {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            path: path.into(),
            sections: parking_lot::Mutex::new(HashMap::new()),
            order: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn open(path: impl Into<std::path::PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let handle = Self::new(path.clone());
        if let Ok(text) = std::fs::read_to_string(&path) {
            handle.set_raw(text);
        }
        Ok(handle)
    }

    fn render(sections: &HashMap<SectionKey, String>, order: &[SectionKey]) -> String {
        let mut out = String::new();
        for key in order {
            let Some(body) = sections.get(key) else { continue };
            out.push_str(&key.section_type);
            for label in &key.labels {
                out.push_str(&format!(" \"{label}\""));
            }
            out.push_str(" {\n");
            out.push_str(body);
            out.push_str("\n}\n\n");
        }
        out
    }
}

impl ConfigFile for FileConfigHandle {
    fn get_raw_text(&self) -> String {
        Self::render(&self.sections.lock(), &self.order.lock())
    }

    fn get_section(&self, section_type: &str, labels: &[String]) -> Option<String> {
        let key = SectionKey {
            section_type: section_type.to_string(),
            labels: labels.to_vec(),
        };
        self.sections.lock().get(&key).cloned()
    }

    fn set_section(&self, section_type: &str, labels: &[String], body: String) {
        let key = SectionKey {
            section_type: section_type.to_string(),
            labels: labels.to_vec(),
        };
        let mut sections = self.sections.lock();
        let mut order = self.order.lock();
        if !sections.contains_key(&key) {
            order.push(key.clone());
        }
        sections.insert(key, body);
    }

    fn set_raw(&self, text: String) {
        // Parsing real HCL is out of scope; the raw buffer is stored as a
        // single synthetic section so round-tripping still works for tests
        // that only care about `get_raw_text`/`save`.
        let key = SectionKey {
            section_type: "__raw".to_string(),
            labels: Vec::new(),
        };
        let mut sections = self.sections.lock();
        let mut order = self.order.lock();
        sections.clear();
        order.clear();
        sections.insert(key.clone(), text);
        order.push(key);
    }

    fn remove_section(&self, section_type: &str, labels: &[String]) -> bool {
        let key = SectionKey {
            section_type: section_type.to_string(),
            labels: labels.to_vec(),
        };
        let mut sections = self.sections.lock();
        let mut order = self.order.lock();
        order.retain(|k| k != &key);
        sections.remove(&key).is_some()
    }

    fn validate(&self, text: &str) -> Vec<Diagnostic> {
        if text.trim().is_empty() {
            return vec![];
        }
        let mut open = 0i32;
        for c in text.chars() {
            match c {
                '{' => open += 1,
                '}' => open -= 1,
                _ => {}
            }
        }
        if open != 0 {
            vec![Diagnostic {
                severity: DiagnosticSeverity::Error,
                message: "unbalanced braces".to_string(),
                line: None,
            }]
        } else {
            vec![]
        }
    }

    fn save(&self) -> anyhow::Result<()> {
        let text = self.get_raw_text();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, text)?;
        Ok(())
    }

    fn diff_against_disk(&self) -> anyhow::Result<String> {
        let on_disk = std::fs::read_to_string(&self.path).unwrap_or_default();
        let in_memory = self.get_raw_text();
        if on_disk == in_memory {
            Ok(String::new())
        } else {
            Ok(format!("--- disk\n+++ memory\n-{on_disk}\n+{in_memory}\n"))
        }
    }
}

/// Applies a single interface's configuration to the live system. Simpler
/// than `safe_apply::NetworkConfigurator<S>` — the reload coordinator
/// applies interfaces one at a time and logs per-interface failures rather
/// than rolling anything back.
#[async_trait]
pub trait InterfaceApplier: Send + Sync {
    async fn apply_interface(&self, interface: &model::InterfaceConfig) -> anyhow::Result<()>;
}

/// A named long-lived service the orchestrator holds and reloads.
#[async_trait]
pub trait ServiceHandle: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
    /// Reconfigures the service in place. Returns whether anything
    /// actually changed.
    async fn reload(&self, config: &Config) -> anyhow::Result<bool>;
    async fn status(&self) -> ServiceStatus;
}

#[derive(Debug, Clone, Default)]
pub struct ServiceStatus {
    pub running: bool,
    pub error: Option<String>,
}

/// The cron-driven task scheduler the reload coordinator syncs `rule_*`
/// and `ipset_*` tasks into.
pub trait TaskScheduler: Send + Sync {
    fn add_task(&self, id: String, cron_schedule: String, action: TaskAction);
    fn remove_task(&self, id: &str) -> bool;
    fn remove_tasks_with_prefix(&self, prefix: &str) -> usize;
    fn list_tasks(&self) -> Vec<ScheduledTask>;
}

#[derive(Debug, Clone)]
pub enum TaskAction {
    EnableRule(String),
    DisableRule(String),
    RefreshIpSet(String),
}

#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub id: String,
    pub cron_schedule: String,
    pub action: TaskAction,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_config_handle_round_trips_sections() {
        let dir = tempfile_dir();
        let handle = FileConfigHandle::new(dir.join("config.hcl"));
        handle.set_section("zone", &["lan".to_string()], "  interface = \"eth0\"".to_string());
        assert!(handle.get_raw_text().contains("zone \"lan\""));
        assert_eq!(
            handle.get_section("zone", &["lan".to_string()]).as_deref(),
            Some("  interface = \"eth0\"")
        );
        assert!(handle.remove_section("zone", &["lan".to_string()]));
        assert!(handle.get_section("zone", &["lan".to_string()]).is_none());
    }

    #[test]
    fn validate_flags_unbalanced_braces() {
        let handle = FileConfigHandle::new("/tmp/nonexistent.hcl");
        assert!(handle.validate("zone \"lan\" {").len() == 1);
        assert!(handle.validate("zone \"lan\" { }").is_empty());
    }

    fn tempfile_dir() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("config-test-{}", std::process::id()))
    }
}
