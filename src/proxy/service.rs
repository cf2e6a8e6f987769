use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderName, HeaderValue, Method, StatusCode};
use http_body::Frame;
use http_body_util::{BodyExt, LengthLimitError, Limited, StreamBody};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, Span, debug, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::exchange::{
    Header, ObservedResponse, RelayExchange, Scheme, gen_id, host_header_value, http_version_label,
    now_rfc3339,
};
use crate::inspector::Verdict;

use super::relay::plain_target;
use super::{Activity, ProxyContext};

pub(crate) type RelayBody = StreamBody<ReceiverStream<Result<Frame<Bytes>, hyper::Error>>>;
pub(crate) type RelayResponse = Response<RelayBody>;

const PUMP_DEPTH: usize = 16;

/// Hop-by-hop headers, never forwarded in either direction.
pub(crate) const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "proxy-authorization",
    "proxy-authenticate",
    "keep-alive",
    "upgrade",
    "te",
    "trailer",
    "trailers",
];

pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Where the requests of one client session are sent.
#[derive(Debug, Clone)]
pub(crate) enum Route {
    /// Each request names its origin in the `Host` header.
    Plain,
    /// Every request goes to the CONNECT target.
    Tunnel { host: String, port: u16 },
}

#[derive(Clone)]
pub(crate) struct SessionScope {
    pub(crate) ctx: Arc<ProxyContext>,
    pub(crate) peer: SocketAddr,
    pub(crate) activity: Activity,
    pub(crate) route: Route,
}

pub(crate) fn full_body(bytes: Bytes) -> RelayBody {
    let (tx, rx) = mpsc::channel(1);
    if !bytes.is_empty() {
        let _ = tx.try_send(Ok(Frame::data(bytes)));
    }
    StreamBody::new(ReceiverStream::new(rx))
}

pub(crate) fn text_response(status: StatusCode, message: &str) -> RelayResponse {
    let mut resp = observed_to_response(&ObservedResponse::text(status.as_u16(), message));
    if status.is_server_error()
        || status == StatusCode::BAD_REQUEST
        || status == StatusCode::REQUEST_TIMEOUT
    {
        resp.headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
    }
    resp
}

/// Turns a synthesized response into a wire response. Invalid parts fall back to a bare 500.
pub(crate) fn observed_to_response(observed: &ObservedResponse) -> RelayResponse {
    let mut builder = Response::builder().status(observed.status);
    for h in &observed.headers {
        if is_hop_by_hop(&h.name) {
            continue;
        }
        if let (Ok(name), Ok(val)) = (h.name.parse::<HeaderName>(), h.value.parse::<HeaderValue>()) {
            builder = builder.header(name, val);
        }
    }
    match builder.body(full_body(observed.body.clone())) {
        Ok(resp) => resp,
        Err(e) => {
            warn!("failed to build synthesized response: {}", e);
            internal_error()
        }
    }
}

fn internal_error() -> RelayResponse {
    let body = Bytes::from_static(b"Internal Server Error\n");
    let mut resp = Response::new(full_body(body.clone()));
    *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    resp.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    resp
}

fn collect_headers(headers: &http::HeaderMap) -> Vec<Header> {
    headers
        .iter()
        .map(|(name, value)| {
            Header::new(name.as_str(), String::from_utf8_lossy(value.as_bytes()))
        })
        .collect()
}

pub(crate) enum RequestBody {
    Complete(Bytes),
    TooLarge,
    /// No frame arrived within the idle timeout.
    Stalled,
}

/// Buffers a request body of at most `limit` bytes. Each frame counts as session
/// activity; a gap longer than `idle` between frames ends the read. A zero `idle`
/// waits forever.
pub(crate) async fn read_request_body<B>(
    body: B,
    limit: usize,
    idle: Duration,
    activity: &Activity,
) -> ProxyResult<RequestBody>
where
    B: http_body::Body<Data = Bytes> + Unpin,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let mut body = Limited::new(body, limit);
    let mut buf = BytesMut::new();
    loop {
        let next = if idle.is_zero() {
            body.frame().await
        } else {
            match tokio::time::timeout(idle, body.frame()).await {
                Ok(next) => next,
                Err(_) => return Ok(RequestBody::Stalled),
            }
        };
        let Some(frame) = next else { break };
        match frame {
            Ok(frame) => {
                activity.touch();
                if let Some(data) = frame.data_ref() {
                    buf.extend_from_slice(data);
                }
            }
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return Ok(RequestBody::TooLarge);
            }
            Err(e) => {
                return match e.downcast::<hyper::Error>() {
                    Ok(err) => Err(ProxyError::Http(*err)),
                    Err(other) => Err(ProxyError::InvalidRequest(other.to_string())),
                };
            }
        }
    }
    Ok(RequestBody::Complete(buf.freeze()))
}

/// Serves one HTTP/1.1 session over `io` until the client closes or it goes idle.
pub(crate) async fn serve_http_session<I>(io: I, scope: SessionScope) -> ProxyResult<()>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let idle = scope.ctx.config.idle_timeout;
    let activity = scope.activity.clone();
    let span = Span::current();
    let service = hyper::service::service_fn(move |req: Request<Incoming>| {
        let scope = scope.clone();
        handle_exchange(scope, req).instrument(span.clone())
    });

    let mut builder = http1::Builder::new();
    builder.keep_alive(true);
    let conn = builder.serve_connection(TokioIo::new(io), service);

    if idle.is_zero() {
        conn.await?;
        return Ok(());
    }
    tokio::select! {
        res = conn => res?,
        _ = activity.wait_idle(idle) => {
            debug!(idle_secs = idle.as_secs(), "session idle; closing");
        }
    }
    Ok(())
}

/// Handles one request: inspect, forward, and stream the response back.
pub(crate) async fn handle_exchange(
    scope: SessionScope,
    req: Request<Incoming>,
) -> ProxyResult<RelayResponse> {
    scope.activity.touch();
    let _guard = scope.activity.guard();
    let ctx = &scope.ctx;

    if req.method() == Method::CONNECT {
        debug!(target = %req.uri(), "CONNECT inside an established session");
        return Ok(text_response(
            StatusCode::BAD_REQUEST,
            "CONNECT is only accepted as the first request on a connection.\n",
        ));
    }

    let (target_host, target_port, scheme) = match &scope.route {
        Route::Plain => match plain_target(req.headers()) {
            Ok(t) => (t.host, t.port, Scheme::Http),
            Err(ProxyError::MissingHostHeader) => {
                debug!(method = %req.method(), uri = %req.uri(), "request without Host header");
                return Ok(text_response(StatusCode::BAD_REQUEST, "Host header is missing.\n"));
            }
            Err(e) => return Ok(text_response(StatusCode::BAD_REQUEST, &format!("{e}\n"))),
        },
        Route::Tunnel { host, port } => (host.clone(), *port, Scheme::Https),
    };

    let (parts, body) = req.into_parts();
    let limit = ctx.config.max_body_bytes;
    let body = match read_request_body(body, limit, ctx.config.idle_timeout, &scope.activity).await? {
        RequestBody::Complete(body) => body,
        RequestBody::TooLarge => {
            debug!(limit, "request body too large");
            return Ok(text_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                &format!("{}\n", ProxyError::BodyTooLarge { limit }),
            ));
        }
        RequestBody::Stalled => {
            debug!(method = %parts.method, uri = %parts.uri, "request body stalled");
            return Ok(text_response(
                StatusCode::REQUEST_TIMEOUT,
                "Request body was not received in time.\n",
            ));
        }
    };

    let mut exchange = RelayExchange {
        id: gen_id(),
        timestamp: now_rfc3339(),
        peer: Some(scope.peer),
        method: parts.method.as_str().to_string(),
        path: parts
            .uri
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        version: http_version_label(parts.version).to_string(),
        headers: collect_headers(&parts.headers),
        body,
        target_host,
        target_port,
        scheme,
    };
    if exchange.header("host").is_none() {
        let host = host_header_value(
            &exchange.target_host,
            exchange.target_port,
            exchange.scheme.default_port(),
        );
        exchange.headers.push(Header::new("host", host));
    }
    debug!(
        id = %exchange.id,
        method = %exchange.method,
        url = %exchange.url(),
        body_len = exchange.body.len(),
        "request received"
    );

    let exchange = match ctx.inspector.inspect_request(exchange) {
        Verdict::Forward(exchange) => exchange,
        Verdict::Respond(resp) => {
            debug!(status = resp.status, "inspector answered request");
            return Ok(observed_to_response(&resp));
        }
    };

    let upstream = match ctx.forwarder.forward(&exchange).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(id = %exchange.id, url = %exchange.url(), "{}", e);
            return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway\n"));
        }
    };
    scope.activity.touch();

    let (resp_parts, upstream_body) = upstream.into_parts();
    let head = ObservedResponse {
        status: resp_parts.status.as_u16(),
        reason: resp_parts.status.canonical_reason().map(str::to_string),
        version: http_version_label(resp_parts.version).to_string(),
        headers: collect_headers(&resp_parts.headers),
        body: Bytes::new(),
        truncated: false,
    };
    debug!(id = %exchange.id, status = head.status, "response head");

    let mut builder = Response::builder().status(resp_parts.status);
    for (name, value) in resp_parts.headers.iter() {
        if is_hop_by_hop(name.as_str()) || name == http::header::TRANSFER_ENCODING {
            continue;
        }
        builder = builder.header(name, value);
    }

    let (tx, rx) = mpsc::channel(PUMP_DEPTH);
    let pump = ResponsePump {
        scope: scope.clone(),
        exchange,
        head,
        guard: scope.activity.guard(),
    };
    tokio::spawn(pump.run(upstream_body, tx).instrument(Span::current()));

    Ok(builder
        .body(StreamBody::new(ReceiverStream::new(rx)))
        .unwrap_or_else(|e| {
            warn!("failed to build relayed response: {}", e);
            internal_error()
        }))
}

/// Streams the origin body to the client while keeping a bounded copy for inspectors.
struct ResponsePump {
    scope: SessionScope,
    exchange: RelayExchange,
    head: ObservedResponse,
    guard: super::InflightGuard,
}

impl ResponsePump {
    async fn run(
        self,
        mut body: Incoming,
        tx: mpsc::Sender<Result<Frame<Bytes>, hyper::Error>>,
    ) {
        let ResponsePump {
            scope,
            exchange,
            mut head,
            guard: _guard,
        } = self;
        let limit = scope.ctx.config.inspect_body_bytes;
        let mut capture = BytesMut::new();
        let mut truncated = false;
        let mut total = 0usize;

        loop {
            let next = tokio::select! {
                next = body.frame() => next,
                _ = tx.closed() => {
                    debug!(id = %exchange.id, sent = total, "client went away mid response");
                    return;
                }
            };
            let Some(frame) = next else { break };
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(id = %exchange.id, "upstream body error: {}", e);
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            if let Some(data) = frame.data_ref() {
                total += data.len();
                let room = limit.saturating_sub(capture.len());
                if data.len() > room {
                    truncated = true;
                }
                capture.extend_from_slice(&data[..data.len().min(room)]);
            }
            scope.activity.touch();
            if tx.send(Ok(frame)).await.is_err() {
                debug!(id = %exchange.id, sent = total, "client went away mid response");
                return;
            }
        }
        drop(tx);

        head.body = capture.freeze();
        head.truncated = truncated;
        debug!(id = %exchange.id, bytes = total, "response complete");
        scope.ctx.inspector.on_exchange_observed(&exchange, &head);
    }
}
