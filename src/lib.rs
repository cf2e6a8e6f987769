//! Intercepting forward proxy.
//!
//! Plain HTTP requests are relayed to the origin named by their `Host` header.
//! `CONNECT` tunnels are terminated locally with a leaf certificate minted for
//! the requested host and signed by a locally trusted root, so the decrypted
//! requests can be inspected before they are forwarded.

pub mod ca;
pub mod config;
pub mod error;
pub mod exchange;
pub mod inspector;
pub mod issuer;
pub mod proxy;
pub mod replay;

use std::sync::Arc;

use tracing::info;

pub use ca::RootAuthority;
pub use config::{ProxyConfig, TunnelUpstream};
pub use error::{CaConfigError, ConfigError, IssueError, ProxyError, ProxyResult, ReplayError, StartupError};
pub use exchange::{Header, ObservedResponse, RelayExchange, Scheme};
pub use inspector::{FlowRecorder, InspectorChain, LoggingInspector, NoopInspector, TrafficInspector, Verdict};
pub use issuer::{CachePolicy, CertificateIssuer, LeafCertificate};
pub use proxy::{Forwarder, ProxyHandle, ProxyServer, SessionTls, TunnelState};

pub const ROOT_COMMON_NAME: &str = "Tunnelscope Root CA";

/// Loads the root, binds the listener and serves until Ctrl-C.
pub async fn run(config: ProxyConfig) -> Result<(), StartupError> {
    let root = if config.init_ca {
        RootAuthority::ensure_files(&config.ca_cert_path, &config.ca_key_path, ROOT_COMMON_NAME)?
    } else {
        RootAuthority::load_from_files(&config.ca_cert_path, &config.ca_key_path)?
    };
    info!(subject = %root.subject(), path = %config.ca_cert_path.display(), "root authority ready");

    let inspector: Arc<dyn TrafficInspector> = Arc::new(LoggingInspector);
    let server = ProxyServer::bind(config, Arc::new(root), inspector).await?;
    let handle = server.spawn()?;

    tokio::signal::ctrl_c().await.map_err(StartupError::Signal)?;
    info!("shutdown requested");
    handle.shutdown().await?;
    Ok(())
}
