//! [`Accept`] trait and the plain acceptor.

use std::{future::Future, io};

/// Turns a freshly accepted socket into the stream the proxy protocol is
/// spoken on.
pub trait Accept<I> {
    /// IO stream produced by accept.
    type Stream;

    fn accept(&self, stream: I) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Hands the socket through untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultAcceptor;

impl<I: Send> Accept<I> for DefaultAcceptor {
    type Stream = I;

    fn accept(&self, stream: I) -> impl Future<Output = io::Result<Self::Stream>> + Send {
        std::future::ready(Ok(stream))
    }
}
