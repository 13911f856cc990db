use std::path::PathBuf;

/// Directory name used under every top-level well-known path.
const NAMESPACE: &str = "border";

/// The Unix-domain socket the RPC server listens on.
///
/// `/run` because systemd creates and tears this down across reboots, and
/// the unprivileged peer runs as a different user that needs to find it by
/// a fixed, well-known path.
pub fn ipc_socket() -> PathBuf {
    PathBuf::from("/run").join(NAMESPACE).join("control.sock")
}

/// Root of all persistent state: flow store database, device id, snapshots.
///
/// `/var/lib` is the correct place for host-specific state that isn't meant
/// for users to edit by hand.
pub fn state_dir() -> Option<PathBuf> {
    Some(PathBuf::from("/var/lib").join(NAMESPACE))
}

/// SQLite database backing the flow store.
pub fn flow_store_db() -> Option<PathBuf> {
    Some(state_dir()?.join("flows.db"))
}

/// Directory the daemon's log files are rolled into.
pub fn daemon_logs() -> Option<PathBuf> {
    Some(PathBuf::from("/var/log").join(NAMESPACE))
}

/// Directory used to stash safe-apply rollback snapshots.
pub fn safe_apply_snapshots() -> Option<PathBuf> {
    Some(PathBuf::from("/run").join(NAMESPACE).join("safe-apply"))
}

/// Path of the persisted log-filter directive, settable at runtime by the
/// unprivileged peer and re-read on the next startup.
pub fn log_filter() -> Option<PathBuf> {
    Some(state_dir()?.join("log-filter"))
}

/// Configuration directory, holding the on-disk representation the
/// `ConfigFile` collaborator reads and writes.
pub fn config_dir() -> Option<PathBuf> {
    Some(PathBuf::from("/etc").join(NAMESPACE))
}
