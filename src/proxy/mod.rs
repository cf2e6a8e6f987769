//! Client-facing listener: plain relay, CONNECT tunnels and the shared session plumbing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::ca::RootAuthority;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::inspector::TrafficInspector;
use crate::issuer::CertificateIssuer;

mod flows;
mod parse;
mod pipe;
mod relay;
mod service;
mod tls;
mod tunnel;
mod upstream;


pub use tls::SessionTls;
pub use tunnel::TunnelState;
pub use upstream::Forwarder;

/// Everything a connection task needs, shared read-only across tasks.
pub(crate) struct ProxyContext {
    pub(crate) config: ProxyConfig,
    pub(crate) issuer: Arc<CertificateIssuer>,
    pub(crate) forwarder: Forwarder,
    pub(crate) inspector: Arc<dyn TrafficInspector>,
}

pub struct ProxyServer {
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
    conn_seq: AtomicU64,
}

impl ProxyServer {
    /// Binds the configured listen address. The root is injected, never loaded here.
    pub async fn bind(
        config: ProxyConfig,
        root: Arc<RootAuthority>,
        inspector: Arc<dyn TrafficInspector>,
    ) -> ProxyResult<Self> {
        let issuer = Arc::new(CertificateIssuer::new(root, config.cert_cache));
        let forwarder = Forwarder::new(&config)?;
        Self::bind_with(config, issuer, forwarder, inspector).await
    }

    /// Like [`bind`](Self::bind) with a caller-built issuer and forwarder.
    pub async fn bind_with(
        config: ProxyConfig,
        issuer: Arc<CertificateIssuer>,
        forwarder: Forwarder,
        inspector: Arc<dyn TrafficInspector>,
    ) -> ProxyResult<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        Ok(Self {
            listener,
            ctx: Arc::new(ProxyContext {
                config,
                issuer,
                forwarder,
                inspector,
            }),
            conn_seq: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn issuer(&self) -> &Arc<CertificateIssuer> {
        &self.ctx.issuer
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.ctx.forwarder
    }

    /// Accepts connections until the task is dropped.
    pub async fn run(self) -> ProxyResult<()> {
        let (_keep, shutdown) = watch::channel(false);
        self.serve(shutdown).await
    }

    /// Runs the accept loop on a background task. Dropping the handle stops
    /// accepting; sessions already running finish on their own.
    pub fn spawn(self) -> ProxyResult<ProxyHandle> {
        let addr = self.local_addr()?;
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(self.serve(rx));
        Ok(ProxyHandle {
            addr,
            shutdown: tx,
            task,
        })
    }

    async fn serve(self, mut shutdown: watch::Receiver<bool>) -> ProxyResult<()> {
        info!(addr = %self.local_addr()?, "proxy listening");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("proxy listener stopping");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((inbound, peer)) => {
                        let id = self.conn_seq.fetch_add(1, Ordering::Relaxed);
                        let ctx = Arc::clone(&self.ctx);
                        let span = info_span!("conn", id, %peer);
                        tokio::spawn(
                            async move {
                                debug!("accepted connection");
                                if let Err(e) = flows::handle_client(ctx, inbound, peer).await {
                                    flows::log_session_error(&e);
                                }
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => {
                        warn!("accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                }
            }
        }
        Ok(())
    }
}

pub struct ProxyHandle {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<ProxyResult<()>>,
}

impl ProxyHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting new connections and waits for the accept loop to exit.
    pub async fn shutdown(self) -> ProxyResult<()> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(res) => res,
            Err(e) => Err(ProxyError::Io(std::io::Error::other(e))),
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Last-activity clock and in-flight counter of one client session.
#[derive(Debug, Clone)]
pub(crate) struct Activity {
    last_activity_ms: Arc<AtomicU64>,
    inflight: Arc<AtomicUsize>,
}

impl Activity {
    pub(crate) fn new() -> Self {
        Self {
            last_activity_ms: Arc::new(AtomicU64::new(now_millis())),
            inflight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn touch(&self) {
        self.last_activity_ms.store(now_millis(), Ordering::Relaxed);
    }

    pub(crate) fn guard(&self) -> InflightGuard {
        InflightGuard::new(Arc::clone(&self.inflight))
    }

    /// Resolves once nothing is in flight and nothing happened for `idle`.
    pub(crate) async fn wait_idle(&self, idle: Duration) {
        let idle_ms = idle.as_millis() as u64;
        let tick = idle.clamp(Duration::from_millis(1), Duration::from_millis(500));
        loop {
            let last = self.last_activity_ms.load(Ordering::Relaxed);
            if now_millis().saturating_sub(last) >= idle_ms
                && self.inflight.load(Ordering::Relaxed) == 0
            {
                break;
            }
            tokio::time::sleep(tick).await;
        }
    }
}

pub(crate) struct InflightGuard {
    counter: Arc<AtomicUsize>,
}

impl InflightGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}
