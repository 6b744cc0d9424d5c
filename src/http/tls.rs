use super::accept::Accept;
use crate::genca::Certificate;
use rustls_pemfile::Item;
use rustls_pki_types::PrivateKeyDer;
use std::{fmt, future::Future, io, sync::Arc, time::Duration};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{
    rustls::{crypto::ring, ServerConfig},
    server::TlsStream,
    TlsAcceptor,
};

/// Tls acceptor using rustls.
///
/// The handshake is bounded by a timeout; a failed or stalled handshake
/// yields an error and the raw socket is dropped without any reply.
#[derive(Clone)]
pub struct RustlsAcceptor {
    config: RustlsConfig,
    handshake_timeout: Duration,
}

impl RustlsAcceptor {
    pub fn new(config: RustlsConfig, handshake_timeout: Duration) -> Self {
        Self {
            config,
            handshake_timeout,
        }
    }
}

impl<I> Accept<I> for RustlsAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send,
{
    type Stream = TlsStream<I>;

    fn accept(&self, stream: I) -> impl Future<Output = io::Result<Self::Stream>> + Send {
        let acceptor = TlsAcceptor::from(self.config.get_inner());
        let handshake_timeout = self.handshake_timeout;

        async move {
            tokio::time::timeout(handshake_timeout, acceptor.accept(stream))
                .await
                .map_err(|elapsed| io::Error::new(io::ErrorKind::TimedOut, elapsed))?
        }
    }
}

impl fmt::Debug for RustlsAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsAcceptor")
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

/// Rustls configuration.
#[derive(Clone)]
pub struct RustlsConfig {
    inner: Arc<ServerConfig>,
}

impl RustlsConfig {
    /// Get inner `Arc<`[`ServerConfig`]`>`.
    pub fn get_inner(&self) -> Arc<ServerConfig> {
        self.inner.clone()
    }

    /// Build a server config serving `certificate`, speaking HTTP/1.1 only.
    pub fn from_certificate(certificate: &Certificate) -> crate::Result<Self> {
        let cert = vec![certificate.der().clone()];
        let key = private_key_from_pem(certificate.key_pem().as_bytes())?;

        let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(cert, key)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            inner: Arc::new(config),
        })
    }
}

impl fmt::Debug for RustlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsConfig").finish()
    }
}

fn private_key_from_pem(pem: &[u8]) -> crate::Result<PrivateKeyDer<'static>> {
    // Check the entire PEM for the key in case it is not the first section
    let mut keys: Vec<PrivateKeyDer<'static>> = rustls_pemfile::read_all(&mut &pem[..])
        .filter_map(|item| match item.ok()? {
            Item::Sec1Key(key) => Some(key.into()),
            Item::Pkcs1Key(key) => Some(key.into()),
            Item::Pkcs8Key(key) => Some(key.into()),
            _ => None,
        })
        .collect();

    match (keys.pop(), keys.is_empty()) {
        (Some(key), true) => Ok(key),
        _ => Err(crate::Error::InvalidCertificate(
            "PEM must contain exactly one private key",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_generated_certificate() {
        let cert = Certificate::generate("localhost").unwrap();
        let config = RustlsConfig::from_certificate(&cert).unwrap();
        assert_eq!(config.get_inner().alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_rejects_missing_key() {
        let cert = Certificate::generate("localhost").unwrap();
        let keyless = Certificate::from_pem("localhost", cert.cert_pem(), "").unwrap();
        assert!(matches!(
            RustlsConfig::from_certificate(&keyless),
            Err(crate::Error::InvalidCertificate(_))
        ));
    }

    #[test]
    fn test_rejects_two_keys() {
        let a = Certificate::generate("localhost").unwrap();
        let b = Certificate::generate("localhost").unwrap();
        let keys = format!("{}{}", a.key_pem(), b.key_pem());
        let doubled = Certificate::from_pem("localhost", a.cert_pem(), keys).unwrap();
        assert!(RustlsConfig::from_certificate(&doubled).is_err());
    }
}
