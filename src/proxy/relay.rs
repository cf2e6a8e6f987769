use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;
use http::header::HOST;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{ProxyError, ProxyResult};

use super::parse::{ConnectTarget, parse_authority};
use super::pipe::Prefixed;
use super::service::{Route, SessionScope, serve_http_session};
use super::{Activity, ProxyContext};

/// Origin named by the `Host` header; the port defaults to 80.
pub(crate) fn plain_target(headers: &HeaderMap) -> ProxyResult<ConnectTarget> {
    let host = headers.get(HOST).ok_or(ProxyError::MissingHostHeader)?;
    let host = host
        .to_str()
        .map_err(|_| ProxyError::InvalidRequest("Host header is not ASCII".into()))?;
    if host.trim().is_empty() {
        return Err(ProxyError::MissingHostHeader);
    }
    parse_authority(host, 80)
        .ok_or_else(|| ProxyError::InvalidRequest(format!("invalid Host header {host:?}")))
}

/// Serves a non-CONNECT client connection. `buffered` holds the bytes already
/// read while classifying the connection and is replayed to the HTTP parser.
pub(crate) async fn serve_plain(
    ctx: Arc<ProxyContext>,
    inbound: TcpStream,
    peer: SocketAddr,
    buffered: Bytes,
) -> ProxyResult<()> {
    debug!(buffered = buffered.len(), "serving plain HTTP session");
    let scope = SessionScope {
        ctx,
        peer,
        activity: Activity::new(),
        route: Route::Plain,
    };
    serve_http_session(Prefixed::new(buffered, inbound), scope).await?;
    debug!("plain HTTP session ended");
    Ok(())
}
