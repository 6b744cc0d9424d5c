use super::{
    auth::Authenticator,
    error::Error,
    head::{self, Head, MAX_HEAD_SIZE},
    ProxyBody,
};
use crate::{
    connect::{Connector, Target},
    registry::{ConnState, Connection},
    serve::Serve,
    tunnel,
};
use http::{header, uri::PathAndQuery, HeaderValue, Uri};
use http_body_util::BodyExt;
use hyper::{
    body::Incoming, ext::ReasonPhrase, server::conn::http1, service::service_fn, Method, Request,
    Response,
};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::{sync::Arc, time::Duration};
use tokio::io::{AsyncRead, AsyncWrite};

const CONNECTION_ESTABLISHED: &[u8] = b"Connection Established";

/// Per-connection HTTP/1.1 driver for the proxy.
#[derive(Clone)]
pub(crate) struct ProxyService {
    handler: Handler,
    header_read_timeout: Duration,
}

impl ProxyService {
    pub fn new(
        authenticator: Authenticator,
        connector: Connector,
        header_read_timeout: Duration,
    ) -> Self {
        ProxyService {
            handler: Handler {
                inner: Arc::new(InnerHandler {
                    authenticator,
                    connector,
                }),
            },
            header_read_timeout,
        }
    }
}

impl Serve for ProxyService {
    async fn serve<S>(self, stream: S, conn: Arc<Connection>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let peer = conn.peer();
        let stream = match tokio::time::timeout(self.header_read_timeout, head::read_head(stream))
            .await
        {
            Ok(Ok(Head::Complete(stream))) => stream,
            Ok(Ok(Head::TooLarge(stream))) => {
                tracing::info!("{} rejected: request head exceeds {} bytes", peer, MAX_HEAD_SIZE);
                head::reject(stream).await;
                return;
            }
            Ok(Ok(Head::Closed)) => return,
            Ok(Err(err)) => {
                tracing::debug!("Failed to read request head from {}: {}", peer, err);
                return;
            }
            Err(_) => {
                tracing::debug!("Timed out reading request head from {}", peer);
                return;
            }
        };

        let handler = self.handler;
        let service = service_fn(move |req| handler.clone().proxy(conn.clone(), req));

        // The head has already been bounded; hyper's limits sit above it.
        let mut builder = http1::Builder::new();
        builder
            .title_case_headers(true)
            .preserve_header_case(true)
            .auto_date_header(false)
            .max_buf_size(MAX_HEAD_SIZE * 2)
            .max_headers(MAX_HEAD_SIZE / 4)
            .timer(TokioTimer::new())
            .header_read_timeout(self.header_read_timeout);

        if let Err(err) = builder
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
        {
            tracing::debug!("Failed to serve connection {}: {}", peer, err);
        }
    }
}

#[derive(Clone)]
struct Handler {
    inner: Arc<InnerHandler>,
}

struct InnerHandler {
    authenticator: Authenticator,
    connector: Connector,
}

impl Handler {
    async fn proxy(
        self,
        conn: Arc<Connection>,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, http::Error> {
        tracing::debug!("Received request from {}: {} {}", conn.peer(), req.method(), req.uri());

        match self.dispatch(&conn, req).await {
            Ok(resp) => Ok(resp),
            Err(err) => {
                tracing::info!("{} rejected while {:?}: {}", conn.peer(), conn.state(), err);
                err.try_into()
            }
        }
    }

    async fn dispatch(
        &self,
        conn: &Arc<Connection>,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, Error> {
        // Same gate for CONNECT and absolute-form, before any upstream work.
        if self.inner.authenticator.is_enabled() {
            conn.advance(ConnState::Authenticating);
        }
        self.inner.authenticator.authenticate(req.headers())?;

        if Method::CONNECT == req.method() {
            self.tunnel(conn, req).await
        } else {
            self.forward(conn, req).await
        }
    }

    /// Received an HTTP request like:
    /// ```text
    /// CONNECT www.domain.com:443 HTTP/1.1
    /// Host: www.domain.com:443
    /// ```
    ///
    /// The upstream is dialed first so that a failure can still be reported
    /// as 502/504. Only after the client has received the 200 can the
    /// connection be upgraded, so the relay runs in its own task.
    async fn tunnel(
        &self,
        conn: &Arc<Connection>,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, Error> {
        let target = connect_target(req.uri())?;

        conn.advance(ConnState::ConnectingUpstream);
        let upstream = self.inner.connector.connect(&target).await?;
        conn.advance(ConnState::Tunneling);

        let conn = conn.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let relayed =
                        tunnel::relay(TokioIo::new(upgraded), upstream, conn.token()).await;
                    tracing::debug!(
                        "tunnel {} <-> {} closed by {:?}: client wrote {} bytes and received {} bytes",
                        conn.peer(),
                        target,
                        relayed.closed_by,
                        relayed.client_to_upstream,
                        relayed.upstream_to_client
                    );
                    if let Some(err) = relayed.error {
                        tracing::debug!("tunnel {} io error: {}", conn.peer(), err);
                    }
                }
                Err(err) => tracing::warn!("upgrade error: {}", err),
            }
        });

        let mut resp = Response::new(super::empty());
        resp.extensions_mut()
            .insert(ReasonPhrase::from_static(CONNECTION_ESTABLISHED));
        Ok(resp)
    }

    /// Relay an absolute-form request and stream the response back.
    async fn forward(
        &self,
        conn: &Arc<Connection>,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, Error> {
        let target = absolute_target(req.uri())?;
        let origin_form = origin_form(req.uri())?;

        conn.advance(ConnState::ConnectingUpstream);
        let upstream = self.inner.connector.connect(&target).await?;
        conn.advance(ConnState::RelayingHttp);

        let (mut sender, connection) = hyper::client::conn::http1::Builder::new()
            .title_case_headers(true)
            .preserve_header_case(true)
            .handshake(TokioIo::new(upstream))
            .await?;

        let token = conn.token();
        let peer = conn.peer();
        tokio::spawn(async move {
            tokio::select! {
                result = connection => if let Err(err) = result {
                    tracing::debug!("upstream connection for {} failed: {}", peer, err);
                },
                _ = token.cancelled() => {}
            }
        });

        let (mut parts, body) = req.into_parts();
        parts.uri = origin_form;
        parts.headers.remove(header::PROXY_AUTHORIZATION);
        parts.headers.remove("proxy-connection");
        if !parts.headers.contains_key(header::HOST) {
            if let Ok(host) = HeaderValue::from_str(&target.to_string()) {
                parts.headers.insert(header::HOST, host);
            }
        }
        parts
            .headers
            .insert(header::CONNECTION, HeaderValue::from_static("close"));

        let resp = sender.send_request(Request::from_parts(parts, body)).await?;
        tracing::debug!("{} {} -> {}", peer, target, resp.status());

        let mut resp = resp.map(|body| body.boxed());
        resp.headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        Ok(resp)
    }
}

/// `host:port` of a CONNECT request; the port is mandatory.
fn connect_target(uri: &Uri) -> Result<Target, Error> {
    let authority = uri
        .authority()
        .ok_or(Error::ClientProtocol("CONNECT must be to a socket address"))?;
    let port = authority
        .port_u16()
        .ok_or(Error::ClientProtocol("CONNECT target is missing a port"))?;
    if authority.host().is_empty() {
        return Err(Error::ClientProtocol("CONNECT target is missing a host"));
    }
    Ok(Target::new(authority.host(), port))
}

/// `scheme://host[:port]/path` targets; only `http` is relayed.
fn absolute_target(uri: &Uri) -> Result<Target, Error> {
    let scheme = uri
        .scheme_str()
        .ok_or(Error::ClientProtocol("request target must be absolute-form"))?;
    if !scheme.eq_ignore_ascii_case("http") {
        return Err(Error::ClientProtocol("only http:// targets can be relayed"));
    }
    let authority = uri
        .authority()
        .filter(|authority| !authority.host().is_empty())
        .ok_or(Error::ClientProtocol("request target is missing a host"))?;

    Ok(Target::new(authority.host(), authority.port_u16().unwrap_or(80)))
}

fn origin_form(uri: &Uri) -> Result<Uri, Error> {
    uri.path_and_query()
        .map(PathAndQuery::as_str)
        .unwrap_or("/")
        .parse()
        .map_err(|_| Error::ClientProtocol("request target has an invalid path"))
}
