//! Cache entries and the cacheability rules.
//!
//! `CachedResponse` is what the pipeline replays; `StoredEntry` is the
//! serializable, possibly compressed form kept by the backends and written
//! to snapshots.

use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cache::compression;
use crate::proxy::headers::filter_response_headers;

/// A fully buffered upstream response, safe to share between requests.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CachedResponse {
    /// Build from an upstream exchange: hop-by-hop and upstream CORS headers
    /// are dropped and Content-Length matches the buffered body.
    pub fn from_upstream(status: StatusCode, upstream: &HeaderMap, body: Bytes) -> Self {
        let mut headers = filter_response_headers(upstream);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        Self {
            status,
            headers,
            body,
        }
    }
}

/// Serializable entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEntry {
    pub status: u16,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Bytes,
    pub compressed: bool,
    pub stored_at_ms: u64,
}

impl StoredEntry {
    /// Encode a response, compressing bodies above `threshold` bytes.
    pub fn encode(response: &CachedResponse, threshold: usize) -> Self {
        let (body, compressed) = compression::maybe_compress(&response.body, threshold);
        Self {
            status: response.status.as_u16(),
            headers: response
                .headers
                .iter()
                .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
                .collect(),
            body,
            compressed,
            stored_at_ms: unix_millis(),
        }
    }

    pub fn decode(&self) -> io::Result<CachedResponse> {
        let body = if self.compressed {
            Bytes::from(compression::decompress(&self.body)?)
        } else {
            self.body.clone()
        };
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let value = HeaderValue::from_bytes(value)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            headers.append(name, value);
        }
        Ok(CachedResponse {
            status,
            headers,
            body,
        })
    }

    /// Bytes charged against the cache budget (stored, i.e. compressed, size).
    pub fn size(&self) -> usize {
        self.body.len()
            + self
                .headers
                .iter()
                .map(|(name, value)| name.len() + value.len())
                .sum::<usize>()
    }

    /// Wall-clock age in milliseconds.
    pub fn age_ms(&self) -> u64 {
        unix_millis().saturating_sub(self.stored_at_ms)
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Why a request skips the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    /// `refresh=true`, `Cache-Control: no-cache` or `Pragma: no-cache`.
    ClientRequest,
    /// Method other than GET, credentials, or `no-store`.
    NotCacheable,
    Disabled,
}

impl BypassReason {
    /// Value for `X-Proxy-Bypass-Reason`, when the reason is worth telling.
    pub fn header_value(&self) -> Option<&'static str> {
        match self {
            BypassReason::ClientRequest => Some("CLIENT_REQUEST"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDecision {
    Eligible,
    Bypass(BypassReason),
}

const CREDENTIAL_HEADERS: [&str; 3] = ["authorization", "cookie", "x-api-key"];

/// Decide whether a request may be served from and stored into the cache.
pub fn request_decision(method: &Method, headers: &HeaderMap, refresh: bool) -> CacheDecision {
    let cache_control = cache_control_directives(headers);
    let pragma_no_cache = headers
        .get_all(header::PRAGMA)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("no-cache"));

    if refresh || pragma_no_cache || cache_control.iter().any(|d| d == "no-cache") {
        return CacheDecision::Bypass(BypassReason::ClientRequest);
    }
    if method != Method::GET {
        return CacheDecision::Bypass(BypassReason::NotCacheable);
    }
    if CREDENTIAL_HEADERS.iter().any(|h| headers.contains_key(*h)) {
        return CacheDecision::Bypass(BypassReason::NotCacheable);
    }
    if cache_control.iter().any(|d| d == "no-store") {
        return CacheDecision::Bypass(BypassReason::NotCacheable);
    }
    CacheDecision::Eligible
}

/// Whether an upstream response may be stored.
pub fn is_storable(status: StatusCode, headers: &HeaderMap, body_len: usize, max_body: usize) -> bool {
    if !status.is_success() || body_len > max_body {
        return false;
    }
    if headers.contains_key(header::SET_COOKIE) {
        return false;
    }
    !cache_control_directives(headers)
        .iter()
        .any(|d| d == "no-store" || d == "private")
}

/// Directive names from every Cache-Control header, lower-cased.
fn cache_control_directives(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|d| {
            d.split('=')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
        .filter(|d| !d.is_empty())
        .collect()
}
