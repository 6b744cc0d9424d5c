//! Bounded read of the first request head, ahead of hyper's own parser.

use bytes::{Bytes, BytesMut};
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Largest request head (start line plus headers) the proxy accepts.
///
/// Kept below the `http` crate's URI length limit so that every oversized
/// head is answered here rather than by hyper.
pub(crate) const MAX_HEAD_SIZE: usize = 32 * 1024;

const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

/// How long a rejected client may keep sending before the socket is dropped.
const LINGER: Duration = Duration::from_secs(1);

pub(crate) enum Head<S> {
    /// A full head arrived within the bound, or the peer stopped sending
    /// early; either way hyper takes it from here.
    Complete(PrefixedStream<S>),
    TooLarge(S),
    /// EOF before the first byte.
    Closed,
}

pub(crate) async fn read_head<S>(mut stream: S) -> io::Result<Head<S>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut scanned: usize = 0;

    loop {
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(Head::Closed);
            }
            return Ok(Head::Complete(PrefixedStream::new(buf.freeze(), stream)));
        }

        // Resume a few bytes back in case the terminator straddles two reads.
        let from = scanned.saturating_sub(3);
        let end = buf[from..]
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .map(|pos| from + pos + 4);
        scanned = buf.len();

        match end {
            Some(end) if end <= MAX_HEAD_SIZE => {
                return Ok(Head::Complete(PrefixedStream::new(buf.freeze(), stream)));
            }
            Some(_) => return Ok(Head::TooLarge(stream)),
            None if buf.len() > MAX_HEAD_SIZE => return Ok(Head::TooLarge(stream)),
            None => {}
        }
    }
}

/// Answer `400` and close, draining what the client still sends for a
/// moment so the response is not lost to a reset.
pub(crate) async fn reject<S>(mut stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if stream.write_all(BAD_REQUEST).await.is_err() || stream.shutdown().await.is_err() {
        return;
    }

    let mut sink = [0u8; 8 * 1024];
    let _ = tokio::time::timeout(LINGER, async {
        while let Ok(n) = stream.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
    })
    .await;
}

/// A stream that replays bytes already read from it before reading on.
pub(crate) struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    fn new(prefix: Bytes, inner: S) -> Self {
        PrefixedStream { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            let chunk = self.prefix.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
