//! Linux backends for both readers, built on `neli`'s netlink/netfilter
//! support. Kept deliberately thin: all decision logic lives in
//! [`crate::log::NfLogReader`] and [`crate::queue::NfQueueCore`], this
//! module only talks to the kernel and feeds them.

use crate::log::{LogEntry, NfLogReader};
use crate::queue::{NfQueueCore, Verdict};
use anyhow::{Context, Result};
use neli::consts::nl::NlmF;
use neli::consts::socket::NlFamily;
use neli::netfilter::{log as nflog, queue as nfqueue};
use neli::socket::tokio::NlSocket;
use packet::MacAddr;
use std::ffi::CString;
use std::sync::Arc;
use std::time::Instant;

/// Opens an NFLOG socket bound to `group` and feeds every received packet
/// into `reader` until the socket errs or the task is cancelled.
pub async fn run_log_reader(group: u16, reader: Arc<NfLogReader>) -> Result<()> {
    let socket = NlSocket::connect(NlFamily::Netfilter, None, &[])
        .context("failed to open NFLOG netlink socket")?;

    let bind = nflog::LogConfigReq::bind(libc::AF_INET, group)
        .context("failed to build NFLOG bind request")?;
    socket
        .send(bind, NlmF::REQUEST | NlmF::ACK)
        .await
        .context("failed to bind NFLOG group")?;

    loop {
        let msg: nflog::LogPacket = socket
            .recv()
            .await
            .context("NFLOG netlink socket closed")?;

        let prefix = msg
            .prefix
            .as_ref()
            .map(|p: &CString| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let entry = LogEntry {
            time: Instant::now(),
            prefix,
            in_iface: msg.ifindex_in.map(|i| i.to_string()),
            out_iface: msg.ifindex_out.map(|i| i.to_string()),
            src_mac: mac_from_hwaddr(&msg.hwaddr),
            packet: packet::parse(&msg.payload),
            sni: packet::extract_sni(&msg.payload),
        };
        reader.record(entry);
    }
}

fn mac_from_hwaddr(hwaddr: &[u8]) -> Option<MacAddr> {
    if hwaddr.len() < 6 {
        return None;
    }
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&hwaddr[..6]);
    Some(MacAddr(mac))
}

/// Opens an NFQUEUE socket bound to `queue_num` and runs packets through
/// `core` until cancelled, applying whatever verdict `core.decide()` returns
/// back to the kernel.
pub async fn run_queue_reader(
    queue_num: u16,
    max_len: u32,
    copy_len: u32,
    core: Arc<NfQueueCore>,
) -> Result<()> {
    let socket = NlSocket::connect(NlFamily::Netfilter, None, &[])
        .context("failed to open NFQUEUE netlink socket")?;

    let bind = nfqueue::QueueConfigReq::bind(queue_num, max_len, copy_len)
        .context("failed to build NFQUEUE bind request")?;
    socket
        .send(bind, NlmF::REQUEST | NlmF::ACK)
        .await
        .context("failed to bind NFQUEUE queue")?;

    loop {
        let msg: nfqueue::QueuePacket = socket
            .recv()
            .await
            .context("NFQUEUE netlink socket closed")?;

        let parsed = packet::parse(&msg.payload);
        let verdict = core.decide(&parsed);
        let nf_verdict = match verdict {
            Verdict::Accept => nfqueue::Verdict::Accept,
            Verdict::Drop => nfqueue::Verdict::Drop,
        };

        let reply = nfqueue::VerdictReq::new(msg.packet_id, nf_verdict);
        if let Err(error) = socket.send(reply, NlmF::REQUEST).await {
            tracing::warn!(%error, "failed to set NFQUEUE verdict with the kernel");
            core.record_verdict_set_error();
        }
    }
}
