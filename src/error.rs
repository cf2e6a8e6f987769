use std::path::PathBuf;

use thiserror::Error;

/// Problems with the root authority material. Fatal at startup.
#[derive(Debug, Error)]
pub enum CaConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("only one of {present} and {missing} exists")]
    PartialMaterial { present: PathBuf, missing: PathBuf },
    #[error("no PEM certificate found in root certificate input")]
    MissingCertificate,
    #[error("invalid root certificate: {0}")]
    InvalidCertificate(String),
    #[error("root certificate is not a certificate authority")]
    NotCa,
    #[error("invalid root private key: {0}")]
    InvalidKey(String),
    #[error("root private key does not match the root certificate")]
    KeyMismatch,
    #[error("issued certificates would not chain to the root: {0}")]
    IssuerMismatch(String),
    #[error("failed to generate root authority: {0}")]
    Generate(String),
}

/// Failure to produce a leaf certificate for one hostname.
#[derive(Debug, Error)]
pub enum IssueError {
    #[error("invalid hostname {0:?}")]
    InvalidHostname(String),
    #[error("certificate generation failed: {0}")]
    Generation(String),
    #[error("issuance task did not complete: {0}")]
    Aborted(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Per-connection failures. None of these stop the listener.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("request has no Host header")]
    MissingHostHeader,

    #[error("malformed CONNECT target {0:?}")]
    MalformedConnectTarget(String),

    #[error("certificate issuance failed for {host}: {source}")]
    CertificateIssuanceFailed {
        host: String,
        #[source]
        source: IssueError,
    },

    #[error("TLS handshake failed for {host}: {reason}")]
    TlsHandshakeFailed { host: String, reason: String },

    #[error("failed to reach upstream {addr}: {message}")]
    UpstreamConnectionFailed { addr: String, message: String },

    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("client did not speak HTTP")]
    NotHttp,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("TLS configuration error: {0}")]
    TlsConfig(#[from] rustls::Error),
}

pub type ProxyResult<T> = Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("no recorded flow with id {0}")]
    UnknownFlow(String),
    #[error("malformed raw request: {0}")]
    MalformedRequest(String),
    #[error(transparent)]
    Upstream(#[from] ProxyError),
}

/// Everything that can keep the proxy from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Ca(#[from] CaConfigError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error("failed to wait for shutdown signal: {0}")]
    Signal(#[source] std::io::Error),
}
