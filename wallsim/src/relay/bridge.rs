use std::borrow::Cow;

use strum_macros::Display;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use super::CHUNK_SIZE;
use crate::error::RelayConnectionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Direction {
    /// From the accepted client towards the next hop.
    Upstream,
    /// From the next hop back to the client.
    Downstream,
}

/// Sees every chunk a bridge relays and may replace it.
pub trait RelayHook: Send + Sync {
    fn on_chunk<'a>(&self, direction: Direction, chunk: &'a [u8]) -> Cow<'a, [u8]>;
}

/// Relays bytes unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl RelayHook for PassThrough {
    fn on_chunk<'a>(&self, direction: Direction, chunk: &'a [u8]) -> Cow<'a, [u8]> {
        tracing::trace!(%direction, bytes = chunk.len(), "Relaying chunk");
        Cow::Borrowed(chunk)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Side {
    Client,
    Upstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStats {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    /// The side whose end of stream finished the bridge.
    pub closed_by: Side,
}

enum Step {
    Eof(Side),
    Failed(std::io::Error),
}

/// Copy bytes both ways in chunks of at most [`CHUNK_SIZE`] until either side
/// reaches end of stream or fails. Both sides are shut down before returning.
pub async fn bridge<C, U>(
    client: C,
    upstream: U,
    hook: &dyn RelayHook,
) -> Result<BridgeStats, RelayConnectionError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);
    let mut client_buf = vec![0u8; CHUNK_SIZE];
    let mut upstream_buf = vec![0u8; CHUNK_SIZE];
    let mut tx_bytes = 0u64;
    let mut rx_bytes = 0u64;

    tracing::debug!("Starting to relay data");
    let step = loop {
        tokio::select! {
            res = client_rd.read(&mut client_buf) => match res {
                Ok(0) => break Step::Eof(Side::Client),
                Ok(n) => {
                    let data = hook.on_chunk(Direction::Upstream, &client_buf[..n]);
                    if let Err(e) = upstream_wr.write_all(&data).await {
                        break Step::Failed(e);
                    }
                    tx_bytes += n as u64;
                }
                Err(e) => break Step::Failed(e),
            },
            res = upstream_rd.read(&mut upstream_buf) => match res {
                Ok(0) => break Step::Eof(Side::Upstream),
                Ok(n) => {
                    let data = hook.on_chunk(Direction::Downstream, &upstream_buf[..n]);
                    if let Err(e) = client_wr.write_all(&data).await {
                        break Step::Failed(e);
                    }
                    rx_bytes += n as u64;
                }
                Err(e) => break Step::Failed(e),
            },
        }
    };

    // Either end going away ends the relay for both.
    let _ = client_wr.shutdown().await;
    let _ = upstream_wr.shutdown().await;

    match step {
        Step::Eof(closed_by) => {
            tracing::debug!(tx_bytes, rx_bytes, %closed_by, "Finished relaying data");
            Ok(BridgeStats {
                tx_bytes,
                rx_bytes,
                closed_by,
            })
        }
        Step::Failed(e) => {
            tracing::debug!(tx_bytes, rx_bytes, error = %e, "Relay aborted");
            Err(RelayConnectionError::Io(e))
        }
    }
}
