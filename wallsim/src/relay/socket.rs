use std::os::fd::AsFd;

use anyhow::Result;
use nix::sys::socket::{setsockopt, sockopt};
use tokio::net::TcpListener;

pub trait SetListenerSockOpts {
    /// TCP keepalive on every accepted connection, so a relay notices a peer
    /// that vanished without closing.
    fn set_listener_common_sock_opts(&self) -> Result<()>;
}

impl SetListenerSockOpts for TcpListener {
    fn set_listener_common_sock_opts(&self) -> Result<()> {
        let fd = self.as_fd();
        setsockopt(&fd, sockopt::KeepAlive, &true)?;
        #[cfg(not(target_os = "macos"))]
        setsockopt(&fd, sockopt::TcpKeepIdle, &30)?;
        setsockopt(&fd, sockopt::TcpKeepInterval, &10)?;
        setsockopt(&fd, sockopt::TcpKeepCount, &5)?;

        Ok(())
    }
}

/// Bind a relay listener with the common socket options applied.
pub async fn bind_listener(addr: std::net::SocketAddr) -> Result<TcpListener> {
    use anyhow::Context as _;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to listen on {addr}"))?;
    listener.set_listener_common_sock_opts()?;
    tracing::info!(listen = %listener.local_addr()?, "Relay listening");
    Ok(listener)
}
