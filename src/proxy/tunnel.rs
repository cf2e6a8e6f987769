use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{ProxyError, ProxyResult};
use crate::exchange::bracketed;

use super::parse::{RequestHead, parse_connect_target};
use super::pipe::{Prefixed, relay_bidirectional};
use super::service::{Route, SessionScope, serve_http_session};
use super::tls::SessionTls;
use super::{Activity, ProxyContext};

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const CONNECT_BAD_GATEWAY: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    AwaitingConnect,
    IssuingCertificate,
    Handshaking,
    DecryptedSessionActive,
    /// Interception disabled; bytes are copied without inspection.
    Passthrough,
    Closed,
    Errored,
}

impl TunnelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TunnelState::Closed | TunnelState::Errored)
    }
}

/// One accepted CONNECT, driven from the request line to close.
pub(crate) struct TunnelSession {
    ctx: Arc<ProxyContext>,
    peer: SocketAddr,
    host: String,
    port: u16,
    state: TunnelState,
}

impl TunnelSession {
    pub(crate) fn new(ctx: Arc<ProxyContext>, peer: SocketAddr) -> Self {
        Self {
            ctx,
            peer,
            host: String::new(),
            port: 0,
            state: TunnelState::AwaitingConnect,
        }
    }

    pub(crate) fn state(&self) -> TunnelState {
        self.state
    }

    fn transition(&mut self, next: TunnelState) {
        debug!(from = ?self.state, to = ?next, host = %self.host, "tunnel state");
        self.state = next;
    }

    fn fail(&mut self, err: ProxyError) -> ProxyError {
        if !self.state.is_terminal() {
            self.transition(TunnelState::Errored);
        }
        err
    }

    pub(crate) async fn run(&mut self, mut inbound: TcpStream, head: RequestHead) -> ProxyResult<()> {
        let target = parse_connect_target(&head.target).map_err(|e| self.fail(e))?;
        self.host = target.host;
        self.port = target.port;
        info!(host = %self.host, port = self.port, "CONNECT");

        if !self.ctx.config.intercept_tls {
            return self.passthrough(inbound, head).await;
        }

        self.transition(TunnelState::IssuingCertificate);
        let leaf = match self.ctx.issuer.issue(&self.host).await {
            Ok(leaf) => leaf,
            Err(source) => {
                let host = self.host.clone();
                return Err(self.fail(ProxyError::CertificateIssuanceFailed { host, source }));
            }
        };

        self.transition(TunnelState::Handshaking);
        if self.ctx.config.send_connect_established {
            inbound
                .write_all(CONNECT_ESTABLISHED)
                .await
                .map_err(|e| self.fail(e.into()))?;
        }
        let tls = SessionTls::open(&leaf).map_err(|e| self.fail(e))?;
        let io = Prefixed::new(head.remaining(), inbound);
        let stream = tls
            .handshake(io, self.ctx.config.handshake_timeout)
            .await
            .map_err(|e| self.fail(e))?;

        self.transition(TunnelState::DecryptedSessionActive);
        let scope = SessionScope {
            ctx: Arc::clone(&self.ctx),
            peer: self.peer,
            activity: Activity::new(),
            route: Route::Tunnel {
                host: self.host.clone(),
                port: self.port,
            },
        };
        serve_http_session(stream, scope)
            .await
            .map_err(|e| self.fail(e))?;
        self.transition(TunnelState::Closed);
        Ok(())
    }

    async fn passthrough(&mut self, mut inbound: TcpStream, head: RequestHead) -> ProxyResult<()> {
        self.transition(TunnelState::Passthrough);
        let addr = format!("{}:{}", bracketed(&self.host), self.port);
        let connect = tokio::time::timeout(
            self.ctx.config.upstream_connect_timeout,
            TcpStream::connect(&addr),
        )
        .await;
        let mut upstream = match connect {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let _ = inbound.write_all(CONNECT_BAD_GATEWAY).await;
                return Err(self.fail(ProxyError::UpstreamConnectionFailed {
                    addr,
                    message: e.to_string(),
                }));
            }
            Err(_) => {
                let _ = inbound.write_all(CONNECT_BAD_GATEWAY).await;
                return Err(self.fail(ProxyError::UpstreamConnectionFailed {
                    addr,
                    message: "connect timed out".into(),
                }));
            }
        };
        inbound
            .write_all(CONNECT_ESTABLISHED)
            .await
            .map_err(|e| self.fail(e.into()))?;
        let early = head.remaining();
        if !early.is_empty() {
            upstream
                .write_all(&early)
                .await
                .map_err(|e| self.fail(e.into()))?;
        }

        let activity = Activity::new();
        let stats = relay_bidirectional(inbound, upstream, &activity, self.ctx.config.idle_timeout)
            .await
            .map_err(|e| self.fail(e.into()))?;
        debug!(
            sent = stats.client_to_upstream,
            received = stats.upstream_to_client,
            "passthrough tunnel ended"
        );
        self.transition(TunnelState::Closed);
        Ok(())
    }
}
