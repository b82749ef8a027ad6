//! The two-hop relay run inside the endpoint nodes: a forward proxy on A that
//! blindly tunnels to B, and a terminating proxy on B that resolves the real
//! destination from the first request line.

pub mod bridge;
pub mod endpoint;
pub mod forward;
pub mod request;
pub mod socket;
pub mod terminate;

pub use bridge::{BridgeStats, Direction, PassThrough, RelayHook};
pub use endpoint::RelayEndpoint;
pub use forward::ForwardProxy;
pub use terminate::TerminatingProxy;

/// Upper bound of a single read, also the only window the terminating proxy
/// looks at for the request line.
pub const CHUNK_SIZE: usize = 4096;

pub const DEFAULT_FORWARD_PORT: u16 = 8080;

pub const DEFAULT_TERMINATE_PORT: u16 = 9090;

/// B's address in the default demo topology.
pub const DEFAULT_NEXT_HOP: &str = "172.20.0.11:9090";

pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

#[cfg(test)]
pub(crate) mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use anyhow::{Context as _, Result};
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::runtime::WallsimRuntime;
    use crate::service::RegistedService;

    pub(crate) fn loopback() -> Result<SocketAddr> {
        let port = portpicker::pick_unused_port().context("No free port left")?;
        Ok(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    /// Serve the given proxies until the returned token is cancelled.
    pub(crate) async fn launch(
        services: Vec<Box<dyn RegistedService + Send + Sync>>,
    ) -> Result<(CancellationToken, JoinHandle<Result<()>>)> {
        let mut runtime = WallsimRuntime::new();
        for (id, service) in services.into_iter().enumerate() {
            runtime.add_service(service, tracing::info_span!("relay", id));
        }
        let canceller = runtime.canceller();
        let (ready_sender, ready_receiver) = tokio::sync::oneshot::channel();
        let join_handle = tokio::spawn(runtime.serve_with_ready(ready_sender));
        tokio::time::timeout(Duration::from_secs(5), ready_receiver).await??;
        Ok((canceller, join_handle))
    }

    /// Echoes every connection back until the peer closes.
    pub(crate) async fn echo_server() -> Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = stream.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        Ok(addr)
    }

    /// Answers a single request with `ok` and reports the request head it saw.
    pub(crate) async fn origin_server() -> Result<(SocketAddr, JoinHandle<Result<String>>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await?;
            let mut head = vec![];
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                .await?;
            stream.shutdown().await?;
            Ok(String::from_utf8(head)?)
        });
        Ok((addr, handle))
    }

    async fn shut(canceller: CancellationToken, join_handle: JoinHandle<Result<()>>) -> Result<()> {
        canceller.cancel();
        tokio::time::timeout(Duration::from_secs(5), join_handle).await???;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn test_chain_rewrites_absolute_request() -> Result<()> {
        let (origin, seen) = origin_server().await?;
        let terminate_addr = loopback()?;
        let forward_addr = loopback()?;

        let (canceller, join_handle) = launch(vec![
            Box::new(TerminatingProxy::new(terminate_addr)),
            Box::new(ForwardProxy::new(
                forward_addr,
                RelayEndpoint::new("127.0.0.1", terminate_addr.port()),
            )),
        ])
        .await?;

        let mut client = TcpStream::connect(forward_addr).await?;
        client
            .write_all(
                format!(
                    "GET http://127.0.0.1:{}/hello?x=1 HTTP/1.1\r\nHost: 127.0.0.1\r\nUser-Agent: wallsim-test\r\n\r\n",
                    origin.port()
                )
                .as_bytes(),
            )
            .await?;
        let mut response = vec![];
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response)).await??;
        assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with(b"\r\n\r\nok"));

        let head = seen.await??;
        assert_eq!(
            head,
            "GET /hello?x=1 HTTP/1.1\r\nHost: 127.0.0.1\r\nUser-Agent: wallsim-test\r\n\r\n"
        );

        shut(canceller, join_handle).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn test_chain_tunnels_connect() -> Result<()> {
        let echo = echo_server().await?;
        let terminate_addr = loopback()?;
        let forward_addr = loopback()?;

        let (canceller, join_handle) = launch(vec![
            Box::new(TerminatingProxy::new(terminate_addr)),
            Box::new(ForwardProxy::new(
                forward_addr,
                RelayEndpoint::new("127.0.0.1", terminate_addr.port()),
            )),
        ])
        .await?;

        let mut client = TcpStream::connect(forward_addr).await?;
        client
            .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", echo.port()).as_bytes())
            .await?;
        let mut reply = vec![0u8; CONNECT_ESTABLISHED.len()];
        client.read_exact(&mut reply).await?;
        assert_eq!(reply, CONNECT_ESTABLISHED);

        // Everything after the handshake is opaque, even bytes that look like HTTP.
        for payload in [&b"\x16\x03\x01binary"[..], b"GET http://x/ HTTP/1.1\r\n\r\n"] {
            client.write_all(payload).await?;
            let mut echoed = vec![0u8; payload.len()];
            client.read_exact(&mut echoed).await?;
            assert_eq!(echoed, payload);
        }

        shut(canceller, join_handle).await
    }
}
