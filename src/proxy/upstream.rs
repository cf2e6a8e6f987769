use bytes::Bytes;
use http::{HeaderName, HeaderValue, Request, Response, Version};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use rustls::ClientConfig;
use tracing::debug;

use crate::config::{ProxyConfig, TunnelUpstream};
use crate::error::{ProxyError, ProxyResult};
use crate::exchange::{
    Header, ObservedResponse, RelayExchange, Scheme, bracketed, http_version_label,
};

use super::service::is_hop_by_hop;

pub(crate) type ForwardBody = Full<Bytes>;

/// Sends exchanges to their origin over a fresh connection each time.
#[derive(Clone)]
pub struct Forwarder {
    client: Client<HttpsConnector<HttpConnector>, ForwardBody>,
    tunnel_upstream: TunnelUpstream,
}

impl Forwarder {
    pub fn new(config: &ProxyConfig) -> ProxyResult<Self> {
        Ok(Self::with_client_config(
            config,
            super::tls::upstream_client_config()?,
        ))
    }

    /// Uses `tls` for origins reached over TLS. Its ALPN list must be empty.
    pub fn with_client_config(config: &ProxyConfig, tls: ClientConfig) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_connect_timeout(Some(config.upstream_connect_timeout));
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(https);
        Self {
            client,
            tunnel_upstream: config.tunnel_upstream,
        }
    }

    fn upstream_scheme(&self, exchange: &RelayExchange) -> &'static str {
        match (exchange.scheme, self.tunnel_upstream) {
            (Scheme::Https, TunnelUpstream::Tls) => "https",
            _ => "http",
        }
    }

    pub(crate) fn upstream_uri(&self, exchange: &RelayExchange) -> String {
        format!(
            "{}://{}{}",
            self.upstream_scheme(exchange),
            authority(exchange),
            exchange.path
        )
    }

    /// Sends `exchange` and returns the origin response with its body unread.
    pub async fn forward(&self, exchange: &RelayExchange) -> ProxyResult<Response<Incoming>> {
        let uri = self.upstream_uri(exchange);
        let req = build_request(&uri, exchange)?;
        debug!(id = %exchange.id, %uri, "forwarding upstream");
        self.client
            .request(req)
            .await
            .map_err(|e| ProxyError::UpstreamConnectionFailed {
                addr: authority(exchange),
                message: error_chain(&e),
            })
    }

    /// Like [`forward`](Self::forward) but reads the whole response body.
    pub async fn send_buffered(&self, exchange: &RelayExchange) -> ProxyResult<ObservedResponse> {
        let resp = self.forward(exchange).await?;
        let (parts, body) = resp.into_parts();
        let body = body.collect().await?.to_bytes();
        let headers = parts
            .headers
            .iter()
            .map(|(n, v)| Header::new(n.as_str(), String::from_utf8_lossy(v.as_bytes())))
            .collect();
        Ok(ObservedResponse {
            status: parts.status.as_u16(),
            reason: parts.status.canonical_reason().map(str::to_string),
            version: http_version_label(parts.version).to_string(),
            headers,
            body,
            truncated: false,
        })
    }
}

fn authority(exchange: &RelayExchange) -> String {
    format!("{}:{}", bracketed(&exchange.target_host), exchange.target_port)
}

/// Builds the outbound request. Hop-by-hop and framing headers are dropped so the
/// client can frame the buffered body itself; `Host` is kept as sent.
pub(crate) fn build_request(uri: &str, exchange: &RelayExchange) -> ProxyResult<Request<ForwardBody>> {
    let mut req = Request::builder()
        .method(exchange.method.as_str())
        .uri(uri)
        .version(Version::HTTP_11)
        .body(Full::new(exchange.body.clone()))
        .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
    for h in &exchange.headers {
        if is_hop_by_hop(&h.name)
            || h.name.eq_ignore_ascii_case("content-length")
            || h.name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        if let (Ok(name), Ok(val)) = (h.name.parse::<HeaderName>(), h.value.parse::<HeaderValue>()) {
            req.headers_mut().append(name, val);
        }
    }
    Ok(req)
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(s) = source {
        msg.push_str(": ");
        msg.push_str(&s.to_string());
        source = s.source();
    }
    msg
}
