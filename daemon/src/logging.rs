//! Log setup for the daemon: a rolling file appender under the configured
//! log directory plus an ANSI-aware stdout layer, both governed by a single
//! reloadable `EnvFilter` the RPC layer can update at runtime without a
//! restart.

use anyhow::{Context, Result};
use std::path::Path;

/// Returned so the caller can keep the file appender's background flush
/// thread alive for the process lifetime and reload the active filter over
/// RPC without a restart.
pub struct LoggingHandles {
    pub filter_handle: logging::FilterReloadHandle,
    _file_handle: logging::file::Handle,
}

pub fn setup(log_dir: &Path, directives: &str, stdout_json: bool) -> Result<LoggingHandles> {
    std::fs::create_dir_all(log_dir).context("failed to create log directory")?;

    let (file_layer, file_handle) = logging::file::layer::<tracing_subscriber::Registry>(log_dir, "border-daemon");

    let filter_handle = logging::setup_global_subscriber(directives.to_string(), file_layer, stdout_json)
        .context("failed to install global subscriber")?;

    Ok(LoggingHandles {
        filter_handle,
        _file_handle: file_handle,
    })
}
