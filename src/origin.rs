use crate::{
    genca::Certificate,
    http::{
        empty, full,
        tls::{RustlsAcceptor, RustlsConfig},
        ProxyBody,
    },
    registry::Connection,
    serve::{self, Serve},
    Context, ServerHandle,
};
use http::{Method, Request, Response, StatusCode};
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::{convert::Infallible, sync::Arc, time::Duration};
use tokio::io::{AsyncRead, AsyncWrite};

/// Body served on `GET /`.
pub const ORIGIN_BODY: &str = "ok";

/// A TLS origin serving a single fixed endpoint, `GET /` → `200 ok`.
///
/// Stands in for a real HTTPS site at the far end of a CONNECT tunnel. Its
/// certificate is self-signed, so clients have to trust
/// [`Certificate::der`] explicitly.
pub struct OriginServer {
    ctx: Context,
    certificate: Certificate,
}

impl OriginServer {
    pub fn new(ctx: Context, certificate: Certificate) -> Self {
        OriginServer { ctx, certificate }
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Bind `port` (0 for any free port) and start serving.
    pub fn start(self, port: u16) -> crate::Result<ServerHandle> {
        let listener = serve::bind(&self.ctx, port)?;
        let config = RustlsConfig::from_certificate(&self.certificate)?;
        let acceptor = RustlsAcceptor::new(config, self.ctx.handshake_timeout);
        let service = OriginService {
            header_read_timeout: self.ctx.handshake_timeout,
        };

        Ok(serve::spawn(
            "HTTPS origin",
            listener,
            acceptor,
            service,
            self.ctx.shutdown_timeout,
        )?)
    }
}

#[derive(Clone)]
struct OriginService {
    header_read_timeout: Duration,
}

impl Serve for OriginService {
    async fn serve<S>(self, stream: S, conn: Arc<Connection>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .header_read_timeout(self.header_read_timeout);

        if let Err(err) = builder
            .serve_connection(TokioIo::new(stream), service_fn(respond))
            .await
        {
            tracing::debug!("origin connection {} failed: {}", conn.peer(), err);
        }
    }
}

async fn respond(req: Request<Incoming>) -> Result<Response<ProxyBody>, Infallible> {
    let resp = match (req.method(), req.uri().path()) {
        (&Method::GET, "/") => Response::new(full(ORIGIN_BODY)),
        _ => {
            let mut resp = Response::new(empty());
            *resp.status_mut() = StatusCode::NOT_FOUND;
            resp
        }
    };
    tracing::debug!("origin {} {} -> {}", req.method(), req.uri(), resp.status());
    Ok(resp)
}
