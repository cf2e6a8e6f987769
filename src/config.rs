use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::issuer::{CachePolicy, DEFAULT_CACHE_TTL};

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_CA_CERT: &str = "mitm-ca/rootCA.pem";
pub const DEFAULT_CA_KEY: &str = "mitm-ca/rootCA.key.pem";

/// How decrypted tunnel requests reach the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelUpstream {
    /// Cleartext HTTP to the CONNECT port.
    #[default]
    Plain,
    /// Re-encrypt with TLS, verifying the origin against webpki and native roots.
    Tls,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,
    /// Generate the root on first start when neither PEM file exists.
    pub init_ca: bool,
    pub cert_cache: CachePolicy,
    /// Bound on reading the first request head and on the TLS handshake.
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub upstream_connect_timeout: Duration,
    pub max_body_bytes: usize,
    /// How much of each response body is kept for inspectors.
    pub inspect_body_bytes: usize,
    pub tunnel_upstream: TunnelUpstream,
    pub send_connect_established: bool,
    /// When off, CONNECT is relayed as an opaque byte tunnel.
    pub intercept_tls: bool,
    pub debug: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            ca_cert_path: PathBuf::from(DEFAULT_CA_CERT),
            ca_key_path: PathBuf::from(DEFAULT_CA_KEY),
            init_ca: false,
            cert_cache: CachePolicy::Ttl(DEFAULT_CACHE_TTL),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            upstream_connect_timeout: Duration::from_secs(10),
            max_body_bytes: 16 * 1024 * 1024,
            inspect_body_bytes: 1024 * 1024,
            tunnel_upstream: TunnelUpstream::Plain,
            send_connect_established: true,
            intercept_tls: true,
            debug: false,
        }
    }
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `lookup`, falling back to defaults for absent keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut cfg = Self::default();

        if let Some(v) = get("PROXY_LISTEN_ADDR") {
            cfg.listen_addr = v.parse().map_err(|e: std::net::AddrParseError| invalid("PROXY_LISTEN_ADDR", &v, e))?;
        }
        if let Some(v) = get("PROXY_CA_CERT") {
            cfg.ca_cert_path = PathBuf::from(v);
        }
        if let Some(v) = get("PROXY_CA_KEY") {
            cfg.ca_key_path = PathBuf::from(v);
        }
        if let Some(v) = get("PROXY_INIT_CA") {
            cfg.init_ca = flag(&v);
        }

        let cache_on = get("PROXY_CERT_CACHE").map(|v| flag(&v)).unwrap_or(true);
        let ttl = match get("PROXY_CERT_CACHE_TTL_SECS") {
            Some(v) => Duration::from_secs(number("PROXY_CERT_CACHE_TTL_SECS", &v)?),
            None => DEFAULT_CACHE_TTL,
        };
        cfg.cert_cache = if cache_on { CachePolicy::Ttl(ttl) } else { CachePolicy::Disabled };

        if let Some(v) = get("PROXY_HANDSHAKE_TIMEOUT_SECS") {
            cfg.handshake_timeout = Duration::from_secs(number("PROXY_HANDSHAKE_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("PROXY_IDLE_SECS") {
            cfg.idle_timeout = Duration::from_secs(number("PROXY_IDLE_SECS", &v)?);
        }
        if let Some(v) = get("PROXY_UPSTREAM_CONNECT_TIMEOUT_SECS") {
            cfg.upstream_connect_timeout =
                Duration::from_secs(number("PROXY_UPSTREAM_CONNECT_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("PROXY_MAX_BODY_BYTES") {
            cfg.max_body_bytes = number("PROXY_MAX_BODY_BYTES", &v)?;
        }
        if let Some(v) = get("PROXY_INSPECT_BODY_BYTES") {
            cfg.inspect_body_bytes = number("PROXY_INSPECT_BODY_BYTES", &v)?;
        }
        if let Some(v) = get("PROXY_TUNNEL_UPSTREAM_TLS") {
            cfg.tunnel_upstream = if flag(&v) { TunnelUpstream::Tls } else { TunnelUpstream::Plain };
        }
        if let Some(v) = get("PROXY_CONNECT_ESTABLISHED") {
            cfg.send_connect_established = flag(&v);
        }
        if let Some(v) = get("PROXY_INTERCEPT_TLS") {
            cfg.intercept_tls = flag(&v);
        }
        if let Some(v) = get("PROXY_DEBUG") {
            cfg.debug = flag(&v);
        }
        Ok(cfg)
    }
}

fn flag(v: &str) -> bool {
    v == "1" || v.eq_ignore_ascii_case("true")
}

fn number<T>(key: &'static str, v: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    v.parse::<T>().map_err(|e| invalid(key, v, e))
}

fn invalid(key: &'static str, value: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<ProxyConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ProxyConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = from_pairs(&[]).unwrap();
        assert_eq!(cfg.listen_addr.to_string(), DEFAULT_LISTEN_ADDR);
        assert_eq!(cfg.ca_cert_path, PathBuf::from(DEFAULT_CA_CERT));
        assert_eq!(cfg.cert_cache, CachePolicy::Ttl(DEFAULT_CACHE_TTL));
        assert_eq!(cfg.tunnel_upstream, TunnelUpstream::Plain);
        assert!(cfg.send_connect_established);
        assert!(cfg.intercept_tls);
        assert!(!cfg.init_ca);
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = from_pairs(&[
            ("PROXY_LISTEN_ADDR", "0.0.0.0:9090"),
            ("PROXY_CERT_CACHE_TTL_SECS", "5"),
            ("PROXY_IDLE_SECS", "3"),
            ("PROXY_TUNNEL_UPSTREAM_TLS", "TRUE"),
            ("PROXY_CONNECT_ESTABLISHED", "0"),
            ("PROXY_INIT_CA", "1"),
            ("PROXY_MAX_BODY_BYTES", "1024"),
        ])
        .unwrap();
        assert_eq!(cfg.listen_addr.port(), 9090);
        assert_eq!(cfg.cert_cache, CachePolicy::Ttl(Duration::from_secs(5)));
        assert_eq!(cfg.idle_timeout, Duration::from_secs(3));
        assert_eq!(cfg.tunnel_upstream, TunnelUpstream::Tls);
        assert!(!cfg.send_connect_established);
        assert!(cfg.init_ca);
        assert_eq!(cfg.max_body_bytes, 1024);
    }

    #[test]
    fn cache_can_be_disabled() {
        let cfg = from_pairs(&[("PROXY_CERT_CACHE", "false")]).unwrap();
        assert_eq!(cfg.cert_cache, CachePolicy::Disabled);
    }

    #[test]
    fn malformed_values_are_errors() {
        let err = from_pairs(&[("PROXY_IDLE_SECS", "soon")]).unwrap_err();
        let ConfigError::Invalid { key, value, .. } = err;
        assert_eq!(key, "PROXY_IDLE_SECS");
        assert_eq!(value, "soon");
        assert!(from_pairs(&[("PROXY_LISTEN_ADDR", "nowhere")]).is_err());
    }
}
