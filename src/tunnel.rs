//! Opaque bidirectional relay between a client and its upstream.

use std::{io, time::Duration};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Size of the per-direction copy buffer. A direction never holds more than
/// one buffer of unwritten data, so a slow writer stalls its reader.
const BUF_SIZE: usize = 16 * 1024;

/// Upper bound on flushing shutdown to a peer that no longer reads.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Which side ended the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedBy {
    Client,
    Upstream,
    Cancelled,
}

#[derive(Debug)]
pub struct Relayed {
    pub closed_by: ClosedBy,
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
    pub error: Option<io::Error>,
}

/// Relay bytes between `client` and `upstream` until either side reaches EOF
/// or fails, or `shutdown` is cancelled. Both sides are shut down and
/// dropped before this returns, so a tunnel never stays half open.
pub async fn relay<C, U>(client: C, upstream: U, shutdown: CancellationToken) -> Relayed
where
    C: AsyncRead + AsyncWrite,
    U: AsyncRead + AsyncWrite,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);
    let mut client_to_upstream = 0;
    let mut upstream_to_client = 0;

    let (closed_by, result) = {
        let outbound = pipe(&mut client_rd, &mut upstream_wr, &mut client_to_upstream);
        let inbound = pipe(&mut upstream_rd, &mut client_wr, &mut upstream_to_client);

        tokio::select! {
            result = outbound => (ClosedBy::Client, result),
            result = inbound => (ClosedBy::Upstream, result),
            _ = shutdown.cancelled() => (ClosedBy::Cancelled, Ok(())),
        }
    };

    let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = tokio::join!(client_wr.shutdown(), upstream_wr.shutdown());
    })
    .await;

    Relayed {
        closed_by,
        client_to_upstream,
        upstream_to_client,
        error: result.err(),
    }
}

async fn pipe<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *copied += n as u64;
    }
}
