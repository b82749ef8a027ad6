use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::Sender;
use tokio_graceful::ShutdownGuard;

use super::bridge::{bridge, BridgeStats, PassThrough, RelayHook};
use super::endpoint::RelayEndpoint;
use super::request::{Destination, ProxyRequest};
use super::socket::bind_listener;
use super::{CHUNK_SIZE, CONNECT_ESTABLISHED};
use crate::error::RelayConnectionError;
use crate::runtime::ShutdownGuardExt as _;
use crate::service::RegistedService;

/// The B side of the relay chain: reads the proxy request, connects to the
/// real destination and relays the rest of the connection.
pub struct TerminatingProxy {
    listen: SocketAddr,
    hook: Arc<dyn RelayHook>,
}

impl TerminatingProxy {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            hook: Arc::new(PassThrough),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn RelayHook>) -> Self {
        self.hook = hook;
        self
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        bind_listener(self.listen).await
    }

    pub async fn run(&self, listener: TcpListener, shutdown_guard: ShutdownGuard) -> Result<()> {
        loop {
            let (client, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = ?e, "Failed to accept connection");
                    continue;
                }
            };

            let hook = self.hook.clone();
            let span = tracing::info_span!("terminate", src = %peer_addr);
            shutdown_guard.spawn_supervised_task_with_span(span, async move {
                match Self::relay(client, hook.as_ref()).await {
                    Ok(stats) => tracing::debug!(?stats, "Connection closed"),
                    Err(e) => tracing::warn!(error = %e, "Connection failed"),
                }
            });
        }
    }

    async fn relay(
        mut client: TcpStream,
        hook: &dyn RelayHook,
    ) -> Result<BridgeStats, RelayConnectionError> {
        // The request line is expected in the first read.
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let n = client.read(&mut chunk).await?;
        let request = ProxyRequest::parse(&chunk[..n])?;
        let destination = request.destination()?;

        match destination {
            Destination::Tunnel(endpoint) => {
                tracing::info!(dst = %endpoint, "Opening tunnel");
                let upstream = connect(&endpoint).await?;
                client.write_all(CONNECT_ESTABLISHED).await?;
                bridge(client, upstream, hook).await
            }
            Destination::Origin { endpoint, path } => {
                tracing::info!(dst = %endpoint, method = %request.method(), %path, "Forwarding request");
                let mut upstream = connect(&endpoint).await?;
                upstream.write_all(&request.rewrite(&path)).await?;
                bridge(client, upstream, hook).await
            }
        }
    }
}

async fn connect(endpoint: &RelayEndpoint) -> Result<TcpStream, RelayConnectionError> {
    TcpStream::connect((endpoint.host(), endpoint.port()))
        .await
        .map_err(|source| RelayConnectionError::UnreachableDestination {
            dst: endpoint.to_string(),
            source,
        })
}

#[async_trait]
impl RegistedService for TerminatingProxy {
    async fn serve(&self, shutdown_guard: ShutdownGuard, ready: Sender<()>) -> Result<()> {
        let listener = self.bind().await?;
        let _ = ready.send(()).await;
        self.run(listener, shutdown_guard).await
    }
}
