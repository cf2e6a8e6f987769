use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, ProxyResult};

use super::ProxyContext;
use super::parse::read_request_head;
use super::relay::serve_plain;
use super::tunnel::TunnelSession;

/// Classifies a fresh client connection by its first request head and hands it
/// to the tunnel negotiator or the plain relay.
pub(crate) async fn handle_client(
    ctx: Arc<ProxyContext>,
    mut inbound: TcpStream,
    peer: SocketAddr,
) -> ProxyResult<()> {
    let read = tokio::time::timeout(ctx.config.handshake_timeout, read_request_head(&mut inbound));
    let head = match read.await {
        Ok(Ok(Some(head))) => head,
        Ok(Ok(None)) => {
            debug!("client closed before sending data");
            return Ok(());
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(ProxyError::Timeout("request head")),
    };
    debug!(method = %head.method, target = %head.target, "first request line");

    if head.is_connect() {
        let mut session = TunnelSession::new(ctx, peer);
        let result = session.run(inbound, head).await;
        debug!(state = ?session.state(), "tunnel finished");
        result
    } else {
        serve_plain(ctx, inbound, peer, head.into_buffered()).await
    }
}

/// Logs a per-connection failure at a level matching how actionable it is.
pub(crate) fn log_session_error(err: &ProxyError) {
    match err {
        ProxyError::Io(_) | ProxyError::Timeout(_) | ProxyError::NotHttp | ProxyError::Http(_) => {
            debug!("connection ended: {}", err)
        }
        ProxyError::TlsHandshakeFailed { .. } => info!("{}", err),
        _ => warn!("{}", err),
    }
}
