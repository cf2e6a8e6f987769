//! Leaf certificates minted on demand for intercepted hostnames.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256, SanType, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::OffsetDateTime;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::ca::RootAuthority;
use crate::error::IssueError;

const LEAF_VALIDITY: time::Duration = time::Duration::days(365);
const CLOCK_SKEW: time::Duration = time::Duration::seconds(60);
const SEQ_BITS: u32 = 20;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub struct LeafCertificate {
    hostname: String,
    serial: u64,
    issued_at: OffsetDateTime,
    not_after: OffsetDateTime,
    minted: Instant,
    cert_der: CertificateDer<'static>,
    key_der: PrivatePkcs8KeyDer<'static>,
    root_der: CertificateDer<'static>,
}

impl fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("hostname", &self.hostname)
            .field("serial", &self.serial)
            .field("issued_at", &self.issued_at)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl LeafCertificate {
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn issued_at(&self) -> OffsetDateTime {
        self.issued_at
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Leaf followed by the root, as presented in the server handshake.
    pub fn chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.cert_der.clone(), self.root_der.clone()]
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.key_der.clone_key())
    }

    fn age(&self) -> Duration {
        self.minted.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    Disabled,
    Ttl(Duration),
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy::Ttl(DEFAULT_CACHE_TTL)
    }
}

#[derive(Default)]
struct CacheSlot {
    cell: OnceCell<Arc<LeafCertificate>>,
}

pub struct CertificateIssuer {
    root: Arc<RootAuthority>,
    policy: CachePolicy,
    cache: DashMap<String, Arc<CacheSlot>>,
    seq: AtomicU64,
    issued: AtomicU64,
}

impl CertificateIssuer {
    pub fn new(root: Arc<RootAuthority>, policy: CachePolicy) -> Self {
        Self {
            root,
            policy,
            cache: DashMap::new(),
            seq: AtomicU64::new(0),
            issued: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Arc<RootAuthority> {
        &self.root
    }

    /// Returns a certificate for `hostname`, minting one if the cache has none.
    ///
    /// Concurrent callers for the same hostname share a single issuance.
    pub async fn issue(&self, hostname: &str) -> Result<Arc<LeafCertificate>, IssueError> {
        let host = normalize_hostname(hostname)?;
        let ttl = match self.policy {
            CachePolicy::Disabled => return self.mint(host).await.map(Arc::new),
            CachePolicy::Ttl(ttl) => ttl,
        };

        loop {
            let slot = Arc::clone(self.cache.entry(host.clone()).or_default().value());
            if let Some(leaf) = slot.cell.get() {
                if leaf.age() < ttl {
                    return Ok(Arc::clone(leaf));
                }
                debug!(host = %host, serial = leaf.serial, "cached certificate expired");
                self.cache.remove_if(&host, |_, current| Arc::ptr_eq(current, &slot));
                continue;
            }
            let leaf = slot
                .cell
                .get_or_try_init(|| async { self.mint(host.clone()).await.map(Arc::new) })
                .await?;
            return Ok(Arc::clone(leaf));
        }
    }

    /// Drops every cached certificate.
    pub fn reset(&self) {
        self.cache.clear();
    }

    /// Number of certificates actually minted so far.
    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    async fn mint(&self, host: String) -> Result<LeafCertificate, IssueError> {
        let serial = self.next_serial();
        self.issued.fetch_add(1, Ordering::Relaxed);
        let root = Arc::clone(&self.root);
        let leaf = tokio::task::spawn_blocking(move || build_leaf(&root, host, serial))
            .await
            .map_err(|e| IssueError::Aborted(e.to_string()))??;
        debug!(host = %leaf.hostname, serial = leaf.serial, "issued leaf certificate");
        Ok(leaf)
    }

    fn next_serial(&self) -> u64 {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) & ((1 << SEQ_BITS) - 1);
        (millis << SEQ_BITS) | seq
    }
}

fn build_leaf(root: &RootAuthority, hostname: String, serial: u64) -> Result<LeafCertificate, IssueError> {
    let mut params = CertificateParams::default();
    params.alg = &PKCS_ECDSA_P256_SHA256;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname.as_str());
    params.distinguished_name = dn;
    params.subject_alt_names = vec![SanType::DnsName(hostname.clone())];
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    }
    params.serial_number = Some(SerialNumber::from(serial));
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let issued_at = OffsetDateTime::now_utc();
    let not_after = issued_at + LEAF_VALIDITY;
    params.not_before = issued_at - CLOCK_SKEW;
    params.not_after = not_after;
    params.key_pair = Some(KeyPair::generate(&PKCS_ECDSA_P256_SHA256).map_err(generation)?);

    let cert = Certificate::from_params(params).map_err(generation)?;
    let cert_der = cert
        .serialize_der_with_signer(root.signer())
        .map_err(generation)?;
    let key_der = cert.serialize_private_key_der();

    Ok(LeafCertificate {
        hostname,
        serial,
        issued_at,
        not_after,
        minted: Instant::now(),
        cert_der: CertificateDer::from(cert_der),
        key_der: PrivatePkcs8KeyDer::from(key_der),
        root_der: root.cert_der().clone(),
    })
}

fn generation(e: impl fmt::Display) -> IssueError {
    IssueError::Generation(e.to_string())
}

/// Lowercases and validates a hostname or IP literal. Brackets around IPv6 are stripped.
pub fn normalize_hostname(raw: &str) -> Result<String, IssueError> {
    let trimmed = raw.trim().trim_end_matches('.');
    let unbracketed = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);
    let host = unbracketed.to_ascii_lowercase();
    let invalid = || IssueError::InvalidHostname(raw.to_string());

    if host.is_empty() || host.len() > 253 {
        return Err(invalid());
    }
    if host.parse::<IpAddr>().is_ok() {
        return Ok(host);
    }
    let labels_ok = host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'*')
    });
    if labels_ok { Ok(host) } else { Err(invalid()) }
}
