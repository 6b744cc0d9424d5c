//! A forward proxy test harness.
//!
//! Three servers live here:
//!
//! - a plain HTTP forward proxy ([`ProxyServer::plain`]) speaking CONNECT
//!   tunneling and absolute-form request relay,
//! - the same proxy behind a TLS listener ([`ProxyServer::secure`]),
//! - a TLS origin ([`OriginServer`]) that answers `GET /` with `ok`.
//!
//! Either proxy can be wrapped with Basic authentication
//! ([`ProxyServer::with_basic_auth`]). Every server is started with
//! `start(port)` and stopped with [`ServerHandle::close`], which closes every
//! connection the server still holds.

mod connect;
mod error;
mod genca;
pub mod http;
mod origin;
mod registry;
mod serve;
mod tunnel;

pub use error::Error;
pub use genca::{Certificate, Date, Validity};
pub use self::http::{auth::Credentials, ProxyServer};
pub use origin::OriginServer;
pub use registry::ConnState;
pub use serve::{Context, ServerHandle};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Port the plain proxy listens on in the test setup.
pub const DEFAULT_HTTP_PROXY_PORT: u16 = 8009;

/// Port the TLS-terminating proxy listens on in the test setup.
pub const DEFAULT_HTTPS_PROXY_PORT: u16 = 8010;

/// Port the secure origin listens on in the test setup.
pub const DEFAULT_ORIGIN_PORT: u16 = 8081;
