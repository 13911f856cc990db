//! Non-Linux stand-in: the public shape stays the same, but there's nothing
//! to bind to, so both readers fail immediately on start.

use crate::log::NfLogReader;
use crate::queue::NfQueueCore;
use anyhow::{bail, Result};
use std::sync::Arc;

pub async fn run_log_reader(_group: u16, _reader: Arc<NfLogReader>) -> Result<()> {
    bail!("NFLOG is only available on Linux");
}

pub async fn run_queue_reader(
    _queue_num: u16,
    _max_len: u32,
    _copy_len: u32,
    _core: Arc<NfQueueCore>,
) -> Result<()> {
    bail!("NFQUEUE is only available on Linux");
}
