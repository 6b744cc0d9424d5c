#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    RcgenError(#[from] rcgen::Error),

    #[error(transparent)]
    TlsError(#[from] tokio_rustls::rustls::Error),

    #[error("invalid certificate material: {0}")]
    InvalidCertificate(&'static str),

    #[error("certificate validity window is empty: not_before must precede not_after")]
    InvalidValidity,

    #[error(transparent)]
    SetGlobalDefaultError(#[from] tracing::subscriber::SetGlobalDefaultError),
}
