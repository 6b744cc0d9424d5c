use crate::{
    http::accept::Accept,
    registry::{ConnState, Connection, Registry},
};
use std::{
    future::Future,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpSocket, TcpStream},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// Settings shared by every server in the harness.
#[derive(Clone, Debug)]
pub struct Context {
    /// Address the listener binds to; the port comes from `start(port)`.
    pub bind: IpAddr,

    /// Listen backlog.
    pub concurrent: u32,

    /// Bound on resolving and connecting to an upstream.
    pub connect_timeout: Duration,

    /// Bound on a TLS handshake and on reading a request head.
    pub handshake_timeout: Duration,

    /// How long `close()` waits for open connections to finish.
    pub shutdown_timeout: Duration,
}

impl Default for Context {
    fn default() -> Self {
        Context {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            concurrent: 1024,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Per-connection protocol handling.
///
/// Implementors get the stream produced by the acceptor and the registered
/// connection it belongs to. The returned future is dropped when the
/// connection is cancelled, which closes the stream.
pub(crate) trait Serve: Clone + Send + Sync + 'static {
    fn serve<S>(self, stream: S, conn: Arc<Connection>) -> impl Future<Output = ()> + Send
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static;
}

pub(crate) fn bind(ctx: &Context, port: u16) -> std::io::Result<TcpListener> {
    let addr = SocketAddr::new(ctx.bind, port);
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(ctx.concurrent)
}

/// Start accepting on `listener`, handing each connection to `service` after
/// `acceptor` has prepared it.
pub(crate) fn spawn<A, S>(
    name: &'static str,
    listener: TcpListener,
    acceptor: A,
    service: S,
    shutdown_timeout: Duration,
) -> std::io::Result<ServerHandle>
where
    A: Accept<TcpStream> + Clone + Send + Sync + 'static,
    A::Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Serve,
{
    let local_addr = listener.local_addr()?;
    let registry = Arc::new(Registry::default());
    let shutdown = CancellationToken::new();
    tracing::info!("{} listening on {}", name, local_addr);

    let task = tokio::spawn(accept_loop(
        name,
        listener,
        acceptor,
        service,
        registry.clone(),
        shutdown.clone(),
    ));

    Ok(ServerHandle {
        name,
        local_addr,
        registry,
        shutdown,
        shutdown_timeout,
        task: Some(task),
    })
}

async fn accept_loop<A, S>(
    name: &'static str,
    listener: TcpListener,
    acceptor: A,
    service: S,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
) where
    A: Accept<TcpStream> + Clone + Send + Sync + 'static,
    A::Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Serve,
{
    loop {
        let (tcp_stream, peer) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            result = listener.accept() => match result {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!("{} failed to accept: {}", name, err);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };

        let conn = registry.register(peer);
        let acceptor = acceptor.clone();
        let service = service.clone();

        tokio::spawn(async move {
            let token = conn.token();
            let serve = async {
                match acceptor.accept(tcp_stream).await {
                    Ok(stream) => service.serve(stream, conn.clone()).await,
                    Err(err) => tracing::debug!("{} handshake with {} failed: {}", name, peer, err),
                }
            };

            tokio::select! {
                _ = token.cancelled() => tracing::debug!("{} closed connection {}", name, peer),
                _ = serve => {}
            }
        });
    }

    tracing::info!("{} stopped accepting", name);
}

/// Handle to a running server.
///
/// Dropping the handle stops the listener and cancels every open
/// connection without waiting; [`ServerHandle::close`] also waits for them.
pub struct ServerHandle {
    name: &'static str,
    local_addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
    shutdown_timeout: Duration,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connections currently open.
    pub fn connections(&self) -> usize {
        self.registry.len()
    }

    /// Peer address and state of every open connection.
    pub fn connection_states(&self) -> Vec<(SocketAddr, ConnState)> {
        self.registry.states()
    }

    /// Stop accepting, close every open connection and wait for them to
    /// finish, at most the shutdown timeout. Returns the number of
    /// connections still open when the wait ended.
    pub async fn close(mut self) -> usize {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::warn!("{} accept loop ended abnormally: {}", self.name, err);
            }
        }

        let closing = self.registry.close_all();
        let remaining = self.registry.drained(self.shutdown_timeout).await;
        if remaining > 0 {
            tracing::warn!(
                "{} on {}: {} connections still open after {:?}",
                self.name,
                self.local_addr,
                remaining,
                self.shutdown_timeout
            );
        } else {
            tracing::info!(
                "{} on {} closed ({} connections)",
                self.name,
                self.local_addr,
                closing
            );
        }
        remaining
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.registry.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::accept::DefaultAcceptor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Clone)]
    struct Echo;

    impl Serve for Echo {
        async fn serve<S>(self, mut stream: S, _conn: Arc<Connection>)
        where
            S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        {
            let mut buf = [0u8; 64];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }

    fn start_echo() -> ServerHandle {
        let ctx = Context::default();
        let listener = bind(&ctx, 0).unwrap();
        spawn("echo", listener, DefaultAcceptor, Echo, ctx.shutdown_timeout).unwrap()
    }

    #[tokio::test]
    async fn test_close_closes_open_connections() {
        let handle = start_echo();
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(handle.connections(), 1);
        assert_eq!(handle.connection_states()[0].1, ConnState::Accepted);

        let addr = handle.local_addr();
        assert_eq!(handle.close().await, 0);

        let mut rest = Vec::new();
        let n = client.read_to_end(&mut rest).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_drop_stops_listener() {
        let handle = start_echo();
        let addr = handle.local_addr();
        drop(handle);

        // Give the accept loop a moment to observe cancellation.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
