use super::{empty, ProxyBody};
use crate::connect::ConnectError;
use http::{header, Response, StatusCode};
use std::sync::Arc;

/// Everything that can end a proxied request early.
///
/// Each variant maps to exactly one response, and every such response closes
/// the connection.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Malformed request line or request target.
    #[error("bad request: {0}")]
    ClientProtocol(&'static str),

    /// No `Proxy-Authorization` header.
    #[error("proxy authentication required")]
    AuthRequired { realm: Arc<str> },

    /// `Proxy-Authorization` present but malformed or wrong.
    #[error("invalid proxy credentials")]
    AuthRejected { realm: Arc<str> },

    /// Connection refused, host unreachable or DNS failure.
    #[error(transparent)]
    UpstreamUnreachable(ConnectError),

    /// The connect phase exceeded its bound.
    #[error(transparent)]
    UpstreamTimeout(ConnectError),

    /// The upstream spoke broken HTTP or hung up before responding.
    #[error("upstream exchange failed: {0}")]
    Upstream(#[from] hyper::Error),
}

impl From<ConnectError> for Error {
    fn from(err: ConnectError) -> Self {
        match err {
            ConnectError::Unreachable { .. } => Error::UpstreamUnreachable(err),
            ConnectError::Timeout { .. } => Error::UpstreamTimeout(err),
        }
    }
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::ClientProtocol(_) => StatusCode::BAD_REQUEST,
            Error::AuthRequired { .. } | Error::AuthRejected { .. } => {
                StatusCode::PROXY_AUTHENTICATION_REQUIRED
            }
            Error::UpstreamUnreachable(_) | Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl TryInto<Response<ProxyBody>> for Error {
    type Error = http::Error;

    fn try_into(self) -> Result<Response<ProxyBody>, Self::Error> {
        let builder = Response::builder()
            .status(self.status())
            .header(header::CONNECTION, "close");

        match self {
            Error::AuthRequired { realm } | Error::AuthRejected { realm } => builder
                .header(header::PROXY_AUTHENTICATE, challenge(&realm))
                .body(empty()),
            _ => builder.body(empty()),
        }
    }
}

/// `Basic realm="..."` with the realm quoted per RFC 7235.
fn challenge(realm: &str) -> String {
    let mut value = String::with_capacity(realm.len() + 14);
    value.push_str("Basic realm=\"");
    for c in realm.chars() {
        if c == '"' || c == '\\' {
            value.push('\\');
        }
        value.push(c);
    }
    value.push('"');
    value
}
