use bytes::Bytes;
use memchr::memchr;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProxyError, ProxyResult};
use crate::exchange::Header;

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 96;

/// The first request head on a client connection plus every byte read so far.
#[derive(Debug, Clone)]
pub(crate) struct RequestHead {
    pub(crate) method: String,
    pub(crate) target: String,
    pub(crate) headers: Vec<Header>,
    buffered: Vec<u8>,
    head_len: usize,
}

impl RequestHead {
    pub(crate) fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Everything read from the socket, head included.
    pub(crate) fn into_buffered(self) -> Bytes {
        Bytes::from(self.buffered)
    }

    /// Bytes the client sent after the head.
    pub(crate) fn remaining(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buffered[self.head_len..])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConnectTarget {
    pub(crate) host: String,
    pub(crate) port: u16,
}

/// Reads until a complete request head is buffered. `Ok(None)` means the client
/// closed without sending anything.
pub(crate) async fn read_request_head<S>(stream: &mut S) -> ProxyResult<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = vec![0u8; 8192];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::InvalidRequest(
                "client closed mid request head".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(sp) = memchr(b' ', &buf) {
            let token = String::from_utf8_lossy(&buf[..sp]);
            if !looks_like_http(&token) {
                return Err(ProxyError::NotHttp);
            }
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let method = req.method.unwrap_or_default().to_string();
                let target = req.path.unwrap_or_default().to_string();
                let headers = req
                    .headers
                    .iter()
                    .map(|h| Header::new(h.name, String::from_utf8_lossy(h.value)))
                    .collect();
                return Ok(Some(RequestHead {
                    method,
                    target,
                    headers,
                    buffered: buf,
                    head_len,
                }));
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEAD_BYTES {
                    return Err(ProxyError::InvalidRequest("request head too large".into()));
                }
            }
            Err(e) => return Err(ProxyError::InvalidRequest(e.to_string())),
        }
    }
}

pub(crate) fn looks_like_http(method: &str) -> bool {
    const METHODS: &[&str] = &[
        "CONNECT", "GET", "POST", "HEAD", "PUT", "DELETE", "OPTIONS", "TRACE", "PATCH",
    ];
    METHODS.iter().any(|m| method.eq_ignore_ascii_case(m))
}

/// Parses the authority of a `CONNECT` request line. The port defaults to 443.
pub(crate) fn parse_connect_target(target: &str) -> ProxyResult<ConnectTarget> {
    parse_authority(target, 443)
        .ok_or_else(|| ProxyError::MalformedConnectTarget(target.to_string()))
}

/// Splits `host[:port]` or `[v6][:port]`. Returns `None` for empty hosts, bad
/// or zero ports, and unbracketed IPv6 literals.
pub(crate) fn parse_authority(authority: &str, default_port: u16) -> Option<ConnectTarget> {
    let authority = authority.trim();
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after {
            "" => None,
            p => Some(p.strip_prefix(':')?),
        };
        (host, port)
    } else {
        match authority.split_once(':') {
            Some((_, p)) if p.contains(':') => return None,
            Some((h, p)) => (h, Some(p)),
            None => (authority, None),
        }
    };
    if host.is_empty() || host.contains(char::is_whitespace) || host.contains('/') {
        return None;
    }
    let port = match port {
        Some(p) => p.parse::<u16>().ok().filter(|p| *p != 0)?,
        None => default_port,
    };
    Some(ConnectTarget {
        host: host.to_string(),
        port,
    })
}

/// Reduces an absolute-form request target to origin-form.
pub(crate) fn origin_form_path(target: &str) -> String {
    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"));
    let path = match rest {
        Some(rest) => match rest.find(['/', '?']) {
            Some(idx) if rest[idx..].starts_with('?') => format!("/{}", &rest[idx..]),
            Some(idx) => rest[idx..].to_string(),
            None => "/".to_string(),
        },
        None => target.to_string(),
    };
    if path.is_empty() { "/".to_string() } else { path }
}
