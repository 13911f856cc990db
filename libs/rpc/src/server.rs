//! Dispatches typed requests to registered handlers over a Unix-domain
//! socket. Each connection runs on its own task; a handler panic
//! is caught, logged, and closes only that connection — the server keeps
//! accepting.

use crate::wire::{JsonCodec, WireReply, WireRequest};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{FramedRead, FramedWrite};

/// A registered RPC operation. `call` returning `Err` is a genuine
/// transport-level failure; business failures are communicated by the
/// handler setting an error field inside its own reply payload.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, request: serde_json::Value) -> anyhow::Result<serde_json::Value>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<serde_json::Value>> + Send,
{
    async fn call(&self, request: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        (self)(request).await
    }
}

pub struct RpcServer {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcServer {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, method: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(method.into(), handler);
    }

    /// Binds the listener at `socket_path` with mode 0666 — the IPC
    /// endpoint is trusted by filesystem permission, not by authenticating
    /// the caller.
    pub fn bind(socket_path: &Path) -> anyhow::Result<UnixListener> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(socket_path)?;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o666))?;
        Ok(listener)
    }

    /// Runs the accept loop until cancelled. A connection that errors (or
    /// whose handler panics) is closed; the loop keeps accepting new ones.
    pub async fn serve(self: Arc<Self>, listener: UnixListener, cancel: tokio_util::sync::CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("RPC server shutting down");
                    return;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.handle_connection(stream).await;
                            });
                        }
                        Err(error) => {
                            tracing::warn!(%error, "RPC listener accept failed");
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, stream: UnixStream) {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader: FramedRead<_, JsonCodec<WireRequest, WireReply>> = FramedRead::new(read_half, JsonCodec::default());
        let mut writer: FramedWrite<_, JsonCodec<WireRequest, WireReply>> = FramedWrite::new(write_half, JsonCodec::default());

        while let Some(frame) = reader.next().await {
            let request = match frame {
                Ok(request) => request,
                Err(error) => {
                    tracing::warn!(%error, "RPC connection read error, closing");
                    return;
                }
            };

            let (result, handler_panicked) = self.dispatch(request.clone()).await;
            let wire = WireReply {
                id: request.id,
                result,
            };
            if let Err(error) = writer.send(&wire).await {
                tracing::warn!(%error, "RPC connection write error, closing");
                return;
            }
            if handler_panicked {
                tracing::warn!("closing RPC connection after handler panic");
                return;
            }
        }
    }

    /// Looks up the handler, invokes it on its own task so a panic can be
    /// caught via `JoinHandle` rather than unwinding through the
    /// connection loop, and maps that panic to a transport-level error.
    /// The second return value is `true` when the handler panicked, telling
    /// the caller to close the connection after writing the reply.
    async fn dispatch(&self, request: WireRequest) -> (Result<serde_json::Value, String>, bool) {
        let Some(handler) = self.handlers.get(&request.method).cloned() else {
            return (Err(format!("unknown method {:?}", request.method)), false);
        };

        let method = request.method.clone();
        let task = tokio::spawn(async move { handler.call(request.payload).await });

        match task.await {
            Ok(Ok(value)) => (Ok(value), false),
            Ok(Err(error)) => (Err(error.to_string()), false),
            Err(join_error) if join_error.is_panic() => {
                tracing::error!(%method, "RPC handler panicked");
                (Err(format!("handler for {method:?} panicked")), true)
            }
            Err(join_error) => (Err(join_error.to_string()), false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RpcClient;

    fn socket_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("rpc-test-{}.sock", uuid_like()))
    }

    fn uuid_like() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos() as u64
    }

    #[tokio::test]
    async fn dispatches_to_registered_handler() {
        let path = socket_path();
        let mut server = RpcServer::new();
        server.register(
            "Echo",
            Arc::new(|payload: serde_json::Value| async move { Ok(payload) }),
        );
        let listener = RpcServer::bind(&path).unwrap();
        let server = Arc::new(server);
        let cancel = tokio_util::sync::CancellationToken::new();
        tokio::spawn(server.clone().serve(listener, cancel.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let client = RpcClient::connect(path.clone()).await.unwrap();
        let reply = client.call("Echo", serde_json::json!({"hello": "world"})).await.unwrap();
        assert_eq!(reply, serde_json::json!({"hello": "world"}));

        cancel.cancel();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn unknown_method_returns_transport_error() {
        let path = socket_path();
        let server = Arc::new(RpcServer::new());
        let listener = RpcServer::bind(&path).unwrap();
        let cancel = tokio_util::sync::CancellationToken::new();
        tokio::spawn(server.clone().serve(listener, cancel.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let client = RpcClient::connect(path.clone()).await.unwrap();
        let reply = client.call("NoSuchMethod", serde_json::json!(null)).await;
        assert!(reply.is_err());

        cancel.cancel();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn handler_panic_is_caught_and_reported_as_transport_error() {
        let path = socket_path();
        let mut server = RpcServer::new();
        server.register("Boom", Arc::new(|_payload: serde_json::Value| async move {
            panic!("handler exploded")
        }));
        let listener = RpcServer::bind(&path).unwrap();
        let server = Arc::new(server);
        let cancel = tokio_util::sync::CancellationToken::new();
        tokio::spawn(server.clone().serve(listener, cancel.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let client = RpcClient::connect(path.clone()).await.unwrap();
        let reply = client.call("Boom", serde_json::json!(null)).await;
        assert!(reply.is_err());

        cancel.cancel();
        let _ = std::fs::remove_file(&path);
    }

    /// `RpcClient::call` transparently reconnects on a closed connection, so
    /// it can't by itself show that the server actually hung up after a
    /// panic. Drive the wire protocol directly over one raw connection
    /// instead: the panic's error reply must be the last thing the server
    /// ever writes on it.
    #[tokio::test]
    async fn handler_panic_closes_the_connection_after_the_reply() {
        let path = socket_path();
        let mut server = RpcServer::new();
        server.register("Boom", Arc::new(|_payload: serde_json::Value| async move {
            panic!("handler exploded")
        }));
        server.register("Echo", Arc::new(|payload: serde_json::Value| async move { Ok(payload) }));
        let listener = RpcServer::bind(&path).unwrap();
        let server = Arc::new(server);
        let cancel = tokio_util::sync::CancellationToken::new();
        tokio::spawn(server.clone().serve(listener, cancel.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let stream = UnixStream::connect(&path).await.unwrap();
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader: FramedRead<_, JsonCodec<WireReply, WireRequest>> = FramedRead::new(read_half, JsonCodec::default());
        let mut writer: FramedWrite<_, JsonCodec<WireReply, WireRequest>> = FramedWrite::new(write_half, JsonCodec::default());

        writer.send(&WireRequest { id: 1, method: "Boom".to_string(), payload: serde_json::json!(null) }).await.unwrap();
        let reply = reader.next().await.unwrap().unwrap();
        assert!(reply.result.is_err());

        writer.send(&WireRequest { id: 2, method: "Echo".to_string(), payload: serde_json::json!(null) }).await.unwrap();
        let next_frame = reader.next().await;
        assert!(next_frame.is_none(), "server should have closed the connection after the panic, got {next_frame:?}");

        cancel.cancel();
        let _ = std::fs::remove_file(&path);
    }
}
