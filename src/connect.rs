use std::{fmt, io, net::SocketAddr, time::Duration};
use tokio::{
    net::{lookup_host, TcpStream},
    time::timeout,
};

/// Upstream address a client asked the proxy to reach.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        // `Authority::host` keeps IPv6 literals bracketed.
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_owned)
            .unwrap_or(host);
        Target { host, port }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Why an upstream connection could not be opened.
#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
    /// Refused, unreachable, or the name did not resolve.
    #[error("upstream {target} unreachable: {source}")]
    Unreachable {
        target: String,
        #[source]
        source: io::Error,
    },

    /// Resolution plus connect did not finish within the connect timeout.
    #[error("connecting to upstream {target} timed out after {elapsed:?}")]
    Timeout { target: String, elapsed: Duration },
}

/// Opens upstream TCP connections with a bounded connect phase.
#[derive(Clone, Debug)]
pub struct Connector {
    connect_timeout: Duration,
}

impl Connector {
    pub fn new(connect_timeout: Duration) -> Self {
        Connector { connect_timeout }
    }

    /// Resolve `target` and connect to the first address that accepts.
    ///
    /// Resolution and every connect attempt share a single deadline, so a
    /// caller always gets an answer within the connect timeout.
    pub async fn connect(&self, target: &Target) -> Result<TcpStream, ConnectError> {
        match timeout(self.connect_timeout, self.connect_with_domain(target)).await {
            Ok(Ok(stream)) => {
                if let Ok(local) = stream.local_addr() {
                    tracing::info!("connect {} via {}", target, local);
                }
                Ok(stream)
            }
            Ok(Err(source)) => Err(ConnectError::Unreachable {
                target: target.to_string(),
                source,
            }),
            Err(_) => Err(ConnectError::Timeout {
                target: target.to_string(),
                elapsed: self.connect_timeout,
            }),
        }
    }

    async fn connect_with_domain(&self, target: &Target) -> io::Result<TcpStream> {
        let addrs = lookup_host((target.host.as_str(), target.port)).await?;
        connect_with_addrs(addrs).await
    }
}

async fn connect_with_addrs(addrs: impl IntoIterator<Item = SocketAddr>) -> io::Result<TcpStream> {
    let mut last_err = None;

    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "host resolved to no addresses",
        )
    }))
}
