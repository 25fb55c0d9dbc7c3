//! The per-connection bidirectional byte-copy loop.
//!
//! One readiness-multiplexed loop over both halves, never a thread per
//! direction. Each wakeup performs one bounded read and writes it fully to
//! the opposite half before the next readiness check, so bytes within a
//! direction stay strictly FIFO. No framing is interpreted.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

/// Bounded read size per wakeup.
pub const SPLICE_BUF: usize = 4096;

/// A transient pairing of an accepted client stream with its upstream
/// counterpart. Lives from accept until both halves are closed.
pub struct ConnectionPair<C, U> {
    client: C,
    upstream: U,
    shutdown: watch::Receiver<bool>,
    half_closed: bool,
}

impl<C, U> ConnectionPair<C, U>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(client: C, upstream: U, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            client,
            upstream,
            shutdown,
            half_closed: false,
        }
    }

    /// Splice until end-of-stream on either half, a reset, or shutdown.
    ///
    /// An empty read marks the pair half-closed and cleanly closes both
    /// halves; any I/O error tears the pair down and propagates.
    pub async fn run(self) -> std::io::Result<()> {
        let Self {
            client,
            upstream,
            mut shutdown,
            mut half_closed,
        } = self;
        let (mut client_r, mut client_w) = tokio::io::split(client);
        let (mut upstream_r, mut upstream_w) = tokio::io::split(upstream);

        let mut from_client = [0u8; SPLICE_BUF];
        let mut from_upstream = [0u8; SPLICE_BUF];

        while !half_closed {
            tokio::select! {
                read = client_r.read(&mut from_client) => match read {
                    Ok(0) => half_closed = true,
                    Ok(n) => upstream_w.write_all(&from_client[..n]).await?,
                    Err(e) => return Err(e),
                },
                read = upstream_r.read(&mut from_upstream) => match read {
                    Ok(0) => half_closed = true,
                    Ok(n) => client_w.write_all(&from_upstream[..n]).await?,
                    Err(e) => return Err(e),
                },
                _ = shutdown.changed() => half_closed = true,
            }
        }

        let _ = upstream_w.shutdown().await;
        let _ = client_w.shutdown().await;
        Ok(())
    }
}
