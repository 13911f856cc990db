//! Stub paths for non-Linux builds (tests only — the daemon doesn't ship here).

use std::path::PathBuf;

pub fn ipc_socket() -> PathBuf {
    std::env::temp_dir().join("border-control.sock")
}

pub fn state_dir() -> Option<PathBuf> {
    Some(std::env::temp_dir().join("border"))
}

pub fn flow_store_db() -> Option<PathBuf> {
    Some(state_dir()?.join("flows.db"))
}

pub fn daemon_logs() -> Option<PathBuf> {
    Some(std::env::temp_dir().join("border-logs"))
}

pub fn safe_apply_snapshots() -> Option<PathBuf> {
    Some(std::env::temp_dir().join("border-safe-apply"))
}

pub fn log_filter() -> Option<PathBuf> {
    Some(state_dir()?.join("log-filter"))
}

pub fn config_dir() -> Option<PathBuf> {
    Some(std::env::temp_dir().join("border-config"))
}
