//! Process-level signal handling: SIGINT/SIGTERM trigger graceful shutdown,
//! SIGHUP triggers a configuration reload, the same split the rest of the
//! workspace uses between "stop" and "reload" signals.

use anyhow::Result;
use futures::future::poll_fn;
use futures::task::{Context, Poll};
use tokio::signal::unix::{signal, Signal, SignalKind};

pub struct Terminate {
    sigint: Signal,
    sigterm: Signal,
}

pub struct Hangup {
    sighup: Signal,
}

impl Terminate {
    pub fn new() -> Result<Self> {
        let sigint = signal(SignalKind::interrupt())?;
        let sigterm = signal(SignalKind::terminate())?;
        Ok(Self { sigint, sigterm })
    }

    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.sigint.poll_recv(cx).is_ready() {
            Poll::Ready(())
        } else if self.sigterm.poll_recv(cx).is_ready() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }

    /// Waits for SIGINT or SIGTERM.
    pub async fn recv(&mut self) {
        poll_fn(|cx| self.poll_recv(cx)).await
    }
}

impl Hangup {
    pub fn new() -> Result<Self> {
        let sighup = signal(SignalKind::hangup())?;
        Ok(Self { sighup })
    }

    /// Waits for SIGHUP.
    pub async fn recv(&mut self) {
        self.sighup.recv().await;
    }
}
