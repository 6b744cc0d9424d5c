pub(crate) mod accept;
pub mod auth;
pub mod error;
mod head;
mod server;
pub(crate) mod tls;

use crate::{connect::Connector, genca::Certificate, serve, Context, ServerHandle};
use accept::DefaultAcceptor;
use auth::{Authenticator, Credentials, DEFAULT_REALM};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use server::ProxyService;
use tls::{RustlsAcceptor, RustlsConfig};

/// Body type of every response the harness produces.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// A forward proxy, plain or TLS-terminating, optionally behind Basic auth.
///
/// ```no_run
/// # async fn run() -> proxy_harness::Result<()> {
/// use proxy_harness::{Context, Credentials, ProxyServer};
///
/// let handle = ProxyServer::plain(Context::default())
///     .with_basic_auth(Credentials::new("username", "password"))
///     .start(8009)?;
/// // ...
/// handle.close().await;
/// # Ok(())
/// # }
/// ```
pub struct ProxyServer {
    ctx: Context,
    certificate: Option<Certificate>,
    authenticator: Authenticator,
}

impl ProxyServer {
    /// A proxy speaking HTTP directly on its TCP listener.
    pub fn plain(ctx: Context) -> Self {
        ProxyServer {
            ctx,
            certificate: None,
            authenticator: Authenticator::None,
        }
    }

    /// A proxy that completes a TLS handshake with `certificate` before
    /// reading any proxy protocol.
    pub fn secure(ctx: Context, certificate: Certificate) -> Self {
        ProxyServer {
            ctx,
            certificate: Some(certificate),
            authenticator: Authenticator::None,
        }
    }

    /// Require `credentials` on every request, CONNECT or absolute-form.
    pub fn with_basic_auth(self, credentials: Credentials) -> Self {
        self.with_basic_auth_realm(DEFAULT_REALM, credentials)
    }

    /// Like [`ProxyServer::with_basic_auth`], advertising `realm` in the
    /// `Proxy-Authenticate` challenge.
    pub fn with_basic_auth_realm(mut self, realm: &str, credentials: Credentials) -> Self {
        self.authenticator = Authenticator::basic(realm, credentials);
        self
    }

    pub fn is_secure(&self) -> bool {
        self.certificate.is_some()
    }

    /// Bind `port` (0 for any free port) and start serving.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self, port: u16) -> crate::Result<ServerHandle> {
        let listener = serve::bind(&self.ctx, port)?;
        let service = ProxyService::new(
            self.authenticator,
            Connector::new(self.ctx.connect_timeout),
            self.ctx.handshake_timeout,
        );

        let handle = match self.certificate {
            None => serve::spawn(
                "HTTP proxy",
                listener,
                DefaultAcceptor,
                service,
                self.ctx.shutdown_timeout,
            )?,
            Some(certificate) => {
                let config = RustlsConfig::from_certificate(&certificate)?;
                let acceptor = RustlsAcceptor::new(config, self.ctx.handshake_timeout);
                serve::spawn(
                    "HTTPS proxy",
                    listener,
                    acceptor,
                    service,
                    self.ctx.shutdown_timeout,
                )?
            }
        };

        Ok(handle)
    }
}

pub(crate) fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}
