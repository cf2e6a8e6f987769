use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::debug;

use super::Activity;

const COPY_BUF: usize = 16 * 1024;

/// A stream that yields `prefix` before reading from `inner`.
///
/// Used to hand bytes consumed while sniffing the request head back to the
/// HTTP or TLS layer that takes over the socket.
pub(crate) struct Prefixed<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Prefixed<S> {
    pub(crate) fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prefixed<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.prefix.has_remaining() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prefixed<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RelayStats {
    pub(crate) client_to_upstream: u64,
    pub(crate) upstream_to_client: u64,
}

/// Copies bytes both ways until either side closes or the pair goes idle.
///
/// EOF on one side is propagated as a write shutdown on the other, and the
/// relay ends as soon as one direction finishes. A zero `idle` disables the
/// idle check.
pub(crate) async fn relay_bidirectional<A, B>(
    client: A,
    upstream: B,
    activity: &Activity,
    idle: Duration,
) -> io::Result<RelayStats>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut in_r, mut in_w) = tokio::io::split(client);
    let (mut up_r, mut up_w) = tokio::io::split(upstream);
    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);

    let client_to_upstream = async {
        let mut buf = vec![0u8; COPY_BUF];
        loop {
            let n = in_r.read(&mut buf).await?;
            if n == 0 {
                let _ = up_w.shutdown().await;
                break;
            }
            activity.touch();
            up_w.write_all(&buf[..n]).await?;
            sent.fetch_add(n as u64, Ordering::Relaxed);
        }
        Ok::<(), io::Error>(())
    };

    let upstream_to_client = async {
        let mut buf = vec![0u8; COPY_BUF];
        loop {
            let n = up_r.read(&mut buf).await?;
            if n == 0 {
                let _ = in_w.shutdown().await;
                break;
            }
            activity.touch();
            in_w.write_all(&buf[..n]).await?;
            received.fetch_add(n as u64, Ordering::Relaxed);
        }
        Ok::<(), io::Error>(())
    };

    let idle_watch = async {
        if idle.is_zero() {
            std::future::pending::<()>().await;
        }
        activity.wait_idle(idle).await;
    };

    let result = tokio::select! {
        res = client_to_upstream => res,
        res = upstream_to_client => res,
        _ = idle_watch => {
            debug!(idle_secs = idle.as_secs(), "relay idle; closing");
            Ok(())
        }
    };
    let stats = RelayStats {
        client_to_upstream: sent.load(Ordering::Relaxed),
        upstream_to_client: received.load(Ordering::Relaxed),
    };
    result.map(|_| stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prefixed_replays_buffered_bytes_first() {
        let (mut far, near) = tokio::io::duplex(64);
        far.write_all(b" world").await.unwrap();
        drop(far);
        let mut stream = Prefixed::new(Bytes::from_static(b"hello"), near);
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn relays_both_ways_and_propagates_close() {
        let (mut client, client_side) = tokio::io::duplex(1024);
        let (upstream_side, mut origin) = tokio::io::duplex(1024);
        let activity = Activity::new();

        let relay = tokio::spawn(async move {
            relay_bidirectional(client_side, upstream_side, &activity, Duration::ZERO).await
        });

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        origin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        origin.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(origin);
        let stats = relay.await.unwrap().unwrap();
        assert_eq!(stats, RelayStats { client_to_upstream: 4, upstream_to_client: 5 });

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn idle_relay_is_closed() {
        let (_client, client_side) = tokio::io::duplex(64);
        let (upstream_side, _origin) = tokio::io::duplex(64);
        let activity = Activity::new();
        let stats = tokio::time::timeout(
            Duration::from_secs(5),
            relay_bidirectional(client_side, upstream_side, &activity, Duration::from_millis(50)),
        )
        .await
        .expect("relay should stop when idle")
        .unwrap();
        assert_eq!(stats, RelayStats::default());
    }
}
