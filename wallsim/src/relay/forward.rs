use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::Sender;
use tokio_graceful::ShutdownGuard;

use super::bridge::{bridge, BridgeStats, PassThrough, RelayHook};
use super::endpoint::RelayEndpoint;
use super::socket::bind_listener;
use crate::error::RelayConnectionError;
use crate::runtime::ShutdownGuardExt as _;
use crate::service::RegistedService;

/// The A side of the relay chain: every accepted connection is bridged,
/// untouched, to one fixed next hop.
pub struct ForwardProxy {
    listen: SocketAddr,
    next_hop: RelayEndpoint,
    hook: Arc<dyn RelayHook>,
}

impl ForwardProxy {
    pub fn new(listen: SocketAddr, next_hop: RelayEndpoint) -> Self {
        Self {
            listen,
            next_hop,
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

    /// Accept until cancelled. Connections are served independently and a
    /// failed one never affects the others.
    pub async fn run(&self, listener: TcpListener, shutdown_guard: ShutdownGuard) -> Result<()> {
        loop {
            let (client, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = ?e, "Failed to accept connection");
                    continue;
                }
            };

            let next_hop = self.next_hop.clone();
            let hook = self.hook.clone();
            let span = tracing::info_span!("forward", src = %peer_addr, dst = %next_hop);
            shutdown_guard.spawn_supervised_task_with_span(span, async move {
                match Self::relay(client, &next_hop, hook.as_ref()).await {
                    Ok(stats) => tracing::debug!(?stats, "Connection closed"),
                    Err(e) => tracing::warn!(error = %e, "Connection failed"),
                }
            });
        }
    }

    async fn relay(
        client: TcpStream,
        next_hop: &RelayEndpoint,
        hook: &dyn RelayHook,
    ) -> Result<BridgeStats, RelayConnectionError> {
        let upstream = TcpStream::connect((next_hop.host(), next_hop.port()))
            .await
            .map_err(|source| RelayConnectionError::UnreachableDestination {
                dst: next_hop.to_string(),
                source,
            })?;
        bridge(client, upstream, hook).await
    }
}

#[async_trait]
impl RegistedService for ForwardProxy {
    async fn serve(&self, shutdown_guard: ShutdownGuard, ready: Sender<()>) -> Result<()> {
        let listener = self.bind().await?;
        let _ = ready.send(()).await;
        self.run(listener, shutdown_guard).await
    }
}
