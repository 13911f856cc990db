//! Connectivity verification for a safe-apply in progress:
//! try a raw TCP connect to a handful of commonly-open ports first, since
//! that's cheaper and works even when the target has no HTTP server, then
//! fall back to an HTTP(S) GET at the root.

use std::net::ToSocketAddrs;
use std::time::Duration;

const TCP_PROBE_PORTS: [u16; 3] = [80, 443, 22];

#[async_trait::async_trait]
pub trait ConnectivityChecker: Send + Sync {
    async fn check(&self, target: &str, timeout: Duration) -> bool;
}

pub struct DefaultConnectivityChecker;

#[async_trait::async_trait]
impl ConnectivityChecker for DefaultConnectivityChecker {
    async fn check(&self, target: &str, timeout: Duration) -> bool {
        for port in TCP_PROBE_PORTS {
            if tcp_connect(target, port, timeout).await {
                return true;
            }
        }
        http_get(target, timeout).await
    }
}

async fn tcp_connect(target: &str, port: u16, timeout: Duration) -> bool {
    let Ok(mut addrs) = (target, port).to_socket_addrs() else {
        return false;
    };
    let Some(addr) = addrs.next() else {
        return false;
    };
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

async fn http_get(target: &str, timeout: Duration) -> bool {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(_) => return false,
    };

    for scheme in ["http", "https"] {
        let url = format!("{scheme}://{target}/");
        if client.get(&url).send().await.is_ok() {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unresolvable_target_is_unreachable() {
        let checker = DefaultConnectivityChecker;
        let reachable = checker
            .check("this-host-does-not-resolve.invalid", Duration::from_millis(100))
            .await;
        assert!(!reachable);
    }
}
