use crate::{Error, Result};
use rcgen::{
    date_time_ymd, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose,
};
use rustls_pki_types::CertificateDer;
use std::fmt;

/// A calendar date, used for certificate validity bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Date {
    pub year: i32,
    pub month: u8,
    pub day: u8,
}

impl Date {
    pub const fn ymd(year: i32, month: u8, day: u8) -> Self {
        Date { year, month, day }
    }
}

/// Validity window of a provisioned certificate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Validity {
    pub not_before: Date,
    pub not_after: Date,
}

impl Default for Validity {
    /// Wide enough to cover any test run.
    fn default() -> Self {
        Validity {
            not_before: Date::ymd(1975, 1, 1),
            not_after: Date::ymd(4096, 1, 1),
        }
    }
}

/// A self-signed certificate and its private key, held in memory only.
#[derive(Clone)]
pub struct Certificate {
    hostname: String,
    validity: Option<Validity>,
    cert_pem: String,
    key_pem: String,
    der: CertificateDer<'static>,
}

impl Certificate {
    /// Generate a self-signed certificate for `hostname` valid over the
    /// default window.
    pub fn generate(hostname: &str) -> Result<Self> {
        Self::generate_with_validity(hostname, Validity::default())
    }

    /// Generate a self-signed certificate for `hostname` valid over
    /// `validity`.
    ///
    /// The hostname becomes both the subject common name and the only
    /// subject alternative name (an IP SAN if it parses as an address).
    pub fn generate_with_validity(hostname: &str, validity: Validity) -> Result<Self> {
        if validity.not_before >= validity.not_after {
            return Err(Error::InvalidValidity);
        }

        let mut params = CertificateParams::new(vec![hostname.to_owned()])?;
        params.not_before = date_time_ymd(
            validity.not_before.year,
            validity.not_before.month,
            validity.not_before.day,
        );
        params.not_after = date_time_ymd(
            validity.not_after.year,
            validity.not_after.month,
            validity.not_after.day,
        );
        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, hostname);
        distinguished_name.push(DnType::OrganizationName, env!("CARGO_PKG_NAME"));
        params.distinguished_name = distinguished_name;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;
        tracing::debug!("Generated self-signed certificate for {}", hostname);

        let mut certificate = Self::from_pem(hostname, cert.pem(), key_pair.serialize_pem())?;
        certificate.validity = Some(validity);
        Ok(certificate)
    }

    /// Wrap an externally supplied PEM certificate and private key.
    pub fn from_pem(
        hostname: impl Into<String>,
        cert_pem: impl Into<String>,
        key_pem: impl Into<String>,
    ) -> Result<Self> {
        let cert_pem = cert_pem.into();
        let der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or(Error::InvalidCertificate("no certificate in PEM"))??;

        Ok(Certificate {
            hostname: hostname.into(),
            validity: None,
            cert_pem,
            key_pem: key_pem.into(),
            der,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The window this certificate was generated with; `None` when the
    /// certificate was supplied.
    pub fn validity(&self) -> Option<Validity> {
        self.validity
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// DER encoding of the certificate, e.g. for a client trust store.
    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("hostname", &self.hostname)
            .field("validity", &self.validity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate() {
        let cert = Certificate::generate("localhost").unwrap();
        assert_eq!(cert.hostname(), "localhost");
        assert_eq!(cert.validity(), Some(Validity::default()));
        assert!(cert.cert_pem().starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(cert.key_pem().contains("PRIVATE KEY-----"));
        assert!(!cert.der().is_empty());
    }

    #[test]
    fn test_every_generation_is_fresh() {
        let a = Certificate::generate("localhost").unwrap();
        let b = Certificate::generate("localhost").unwrap();
        assert_ne!(a.key_pem(), b.key_pem());
        assert_ne!(a.der(), b.der());
    }

    #[test]
    fn test_ip_hostname() {
        let cert = Certificate::generate("127.0.0.1").unwrap();
        assert_eq!(cert.hostname(), "127.0.0.1");
    }

    #[test]
    fn test_inverted_validity() {
        let validity = Validity {
            not_before: Date::ymd(2030, 1, 1),
            not_after: Date::ymd(2020, 1, 1),
        };
        assert!(matches!(
            Certificate::generate_with_validity("localhost", validity),
            Err(Error::InvalidValidity)
        ));
    }

    #[test]
    fn test_from_pem() {
        let generated = Certificate::generate("localhost").unwrap();
        let supplied =
            Certificate::from_pem("localhost", generated.cert_pem(), generated.key_pem()).unwrap();
        assert_eq!(supplied.der(), generated.der());
        assert_eq!(supplied.validity(), None);

        assert!(matches!(
            Certificate::from_pem("localhost", "not a pem", generated.key_pem()),
            Err(Error::InvalidCertificate(_))
        ));
    }
}
