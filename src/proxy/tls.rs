use std::sync::Arc;
use std::time::Duration;

use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::{debug, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::issuer::LeafCertificate;

pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Server side TLS endpoint for one tunnel, holding the leaf issued for its host.
pub struct SessionTls {
    host: String,
    acceptor: TlsAcceptor,
}

impl SessionTls {
    pub fn open(leaf: &LeafCertificate) -> ProxyResult<Self> {
        let mut cfg = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(leaf.chain(), leaf.private_key())?;
        cfg.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Self {
            host: leaf.hostname().to_string(),
            acceptor: TlsAcceptor::from(Arc::new(cfg)),
        })
    }

    /// Runs the server handshake on `io`, bounded by `timeout`.
    pub async fn handshake<IO>(self, io: IO, timeout: Duration) -> ProxyResult<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let failed = |reason: String| ProxyError::TlsHandshakeFailed {
            host: self.host.clone(),
            reason,
        };
        match tokio::time::timeout(timeout, self.acceptor.accept(io)).await {
            Ok(Ok(stream)) => {
                let (_, conn) = stream.get_ref();
                debug!(
                    host = %self.host,
                    sni = conn.server_name().unwrap_or(""),
                    version = ?conn.protocol_version(),
                    "client TLS established"
                );
                Ok(stream)
            }
            Ok(Err(e)) => Err(failed(e.to_string())),
            Err(_) => Err(failed(format!("no handshake within {}s", timeout.as_secs()))),
        }
    }
}

/// Client config used when tunnel requests are re-encrypted to the origin.
pub(crate) fn upstream_client_config() -> ProxyResult<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = roots.add_parsable_certificates(certs);
            debug!(added, ignored, "loaded native root certificates");
        }
        Err(e) => warn!("failed to load native root certificates: {}", e),
    }
    Ok(ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth())
}
