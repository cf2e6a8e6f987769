use std::borrow::Cow;
use std::fmt::Write as _;
use std::net::SocketAddr;

use base64::Engine as _;
use base64::engine::general_purpose;
use bytes::Bytes;
use rand::{Rng, distributions::Alphanumeric};
use serde::Serialize;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// One request as seen by the proxy, with its body fully buffered.
#[derive(Debug, Clone)]
pub struct RelayExchange {
    pub id: String,
    pub timestamp: String,
    pub peer: Option<SocketAddr>,
    pub method: String,
    /// Origin-form path including the query string.
    pub path: String,
    /// HTTP version label without the `HTTP/` prefix, e.g. `1.1`.
    pub version: String,
    pub headers: Vec<Header>,
    pub body: Bytes,
    pub target_host: String,
    pub target_port: u16,
    pub scheme: Scheme,
}

impl RelayExchange {
    pub fn url(&self) -> String {
        let host = bracketed(&self.target_host);
        if self.target_port == self.scheme.default_port() {
            format!("{}://{}{}", self.scheme.as_str(), host, self.path)
        } else {
            format!(
                "{}://{}:{}{}",
                self.scheme.as_str(),
                host,
                self.target_port,
                self.path
            )
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Replaces the first header named `name`, or appends it.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|h| h.name.eq_ignore_ascii_case(name))
        {
            Some(h) => h.value = value,
            None => self.headers.push(Header::new(name, value)),
        }
    }

    /// Request line, headers, blank line, then the body as lossy UTF-8.
    pub fn request_display(&self) -> String {
        let mut out = format!("{} {} HTTP/{}\r\n", self.method, self.path, self.version);
        for h in &self.headers {
            let _ = write!(out, "{}: {}\r\n", h.name, h.value);
        }
        out.push_str("\r\n");
        out.push_str(&String::from_utf8_lossy(&self.body));
        out
    }

    pub fn to_event(&self) -> HttpRequestEvent {
        HttpRequestEvent {
            id: self.id.clone(),
            timestamp: self.timestamp.clone(),
            peer: self.peer.map(|p| p.to_string()),
            scheme: self.scheme,
            host: self.target_host.clone(),
            port: self.target_port,
            method: self.method.clone(),
            path: self.path.clone(),
            version: self.version.clone(),
            headers: self.headers.clone(),
            body_base64: encode_body(&self.body),
            body_len: self.body.len(),
        }
    }
}

/// Response metadata plus the body bytes kept for inspection.
#[derive(Debug, Clone)]
pub struct ObservedResponse {
    pub status: u16,
    pub reason: Option<String>,
    pub version: String,
    pub headers: Vec<Header>,
    pub body: Bytes,
    /// Set when the body streamed to the client was longer than `body`.
    pub truncated: bool,
}

impl ObservedResponse {
    pub fn new(status: u16, headers: Vec<Header>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            reason: None,
            version: "1.1".into(),
            headers,
            body: body.into(),
            truncated: false,
        }
    }

    /// Plain-text response with a matching content-length.
    pub fn text(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        let headers = vec![
            Header::new("content-type", "text/plain; charset=utf-8"),
            Header::new("content-length", message.len().to_string()),
        ];
        Self::new(status, headers, message)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn display(&self) -> String {
        let mut out = format!("HTTP/{} {}", self.version, self.status);
        if let Some(reason) = &self.reason {
            out.push(' ');
            out.push_str(reason);
        }
        out.push_str("\n--- HEADERS ---\n");
        for h in &self.headers {
            let _ = writeln!(out, "{}: {}", h.name, h.value);
        }
        out.push_str("--- BODY ---\n");
        out.push_str(&String::from_utf8_lossy(&self.body));
        out
    }

    pub fn to_event(&self, id: &str) -> HttpResponseEvent {
        HttpResponseEvent {
            id: id.to_string(),
            timestamp: now_rfc3339(),
            status_code: self.status,
            reason: self.reason.clone(),
            version: self.version.clone(),
            headers: self.headers.clone(),
            body_base64: encode_body(&self.body),
            body_len: self.body.len(),
            truncated: self.truncated,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpRequestEvent {
    pub id: String,
    pub timestamp: String,
    pub peer: Option<String>,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: Vec<Header>,
    pub body_base64: Option<String>,
    pub body_len: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpResponseEvent {
    pub id: String,
    pub timestamp: String,
    pub status_code: u16,
    pub reason: Option<String>,
    pub version: String,
    pub headers: Vec<Header>,
    pub body_base64: Option<String>,
    pub body_len: usize,
    pub truncated: bool,
}

fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

fn encode_body(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        None
    } else {
        Some(general_purpose::STANDARD.encode(body))
    }
}

/// Wraps IPv6 literals in brackets so a port can follow.
pub(crate) fn bracketed(host: &str) -> Cow<'_, str> {
    if host.contains(':') {
        Cow::Owned(format!("[{host}]"))
    } else {
        Cow::Borrowed(host)
    }
}

/// `Host` header value for `host:port`; the port is left out when it is `default_port`.
pub(crate) fn host_header_value(host: &str, port: u16, default_port: u16) -> String {
    if port == default_port {
        bracketed(host).into_owned()
    } else {
        format!("{}:{}", bracketed(host), port)
    }
}

pub(crate) fn http_version_label(ver: http::Version) -> &'static str {
    match ver {
        http::Version::HTTP_09 => "0.9",
        http::Version::HTTP_10 => "1.0",
        http::Version::HTTP_11 => "1.1",
        http::Version::HTTP_2 => "2",
        http::Version::HTTP_3 => "3",
        _ => "",
    }
}

pub fn gen_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RelayExchange {
        RelayExchange {
            id: gen_id(),
            timestamp: now_rfc3339(),
            peer: None,
            method: "POST".into(),
            path: "/v1/items?q=1".into(),
            version: "1.1".into(),
            headers: vec![
                Header::new("Host", "api.test:8443"),
                Header::new("Accept", "a"),
                Header::new("accept", "b"),
            ],
            body: Bytes::from_static(b"{\"k\":1}"),
            target_host: "api.test".into(),
            target_port: 8443,
            scheme: Scheme::Https,
        }
    }

    #[test]
    fn url_omits_default_ports_and_brackets_ipv6() {
        let mut ex = sample();
        assert_eq!(ex.url(), "https://api.test:8443/v1/items?q=1");
        ex.target_port = 443;
        assert_eq!(ex.url(), "https://api.test/v1/items?q=1");
        ex.target_host = "::1".into();
        ex.scheme = Scheme::Http;
        ex.target_port = 80;
        assert_eq!(ex.url(), "http://[::1]/v1/items?q=1");
    }

    #[test]
    fn header_lookup_keeps_duplicates_in_order() {
        let mut ex = sample();
        assert_eq!(ex.header("ACCEPT"), Some("a"));
        ex.set_header("accept", "c");
        let accepts: Vec<_> = ex
            .headers
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case("accept"))
            .map(|h| h.value.as_str())
            .collect();
        assert_eq!(accepts, ["c", "b"]);
        ex.set_header("X-New", "1");
        assert_eq!(ex.headers.last().map(|h| h.name.as_str()), Some("X-New"));
    }

    #[test]
    fn request_display_renders_raw_form() {
        let text = sample().request_display();
        assert!(text.starts_with("POST /v1/items?q=1 HTTP/1.1\r\nHost: api.test:8443\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"k\":1}"));
    }

    #[test]
    fn response_display_has_sections() {
        let mut resp = ObservedResponse::text(404, "nope");
        resp.reason = Some("Not Found".into());
        let text = resp.display();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\n--- HEADERS ---\n"));
        assert!(text.contains("content-length: 4\n"));
        assert!(text.ends_with("--- BODY ---\nnope"));
    }

    #[test]
    fn events_serialize_with_base64_bodies() {
        let ex = sample();
        let json = serde_json::to_value(ex.to_event()).unwrap();
        assert_eq!(json["scheme"], "https");
        assert_eq!(json["body_base64"], "eyJrIjoxfQ==");
        let resp = serde_json::to_value(ObservedResponse::new(204, vec![], Bytes::new()).to_event(&ex.id)).unwrap();
        assert!(resp["body_base64"].is_null());
        assert_eq!(resp["id"], ex.id.as_str());
    }

    #[test]
    fn synthesized_host_brackets_ipv6_and_drops_default_port() {
        assert_eq!(host_header_value("secure.test", 443, 443), "secure.test");
        assert_eq!(host_header_value("secure.test", 8443, 443), "secure.test:8443");
        assert_eq!(host_header_value("::1", 8443, 443), "[::1]:8443");
        assert_eq!(host_header_value("::1", 443, 443), "[::1]");
    }
}
