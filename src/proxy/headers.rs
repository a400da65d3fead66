//! Header transforms on both sides of the forward.

use std::net::IpAddr;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};

use crate::config::ForwardConfig;

/// Connection-scoped headers that never cross the proxy.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Header names listed in the `Connection` header.
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Upstream response headers safe to relay: hop-by-hop and upstream
/// `Access-Control-*` headers are removed so the relay's own CORS policy
/// is the only one the caller sees.
pub fn filter_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let dropped = connection_tokens(upstream);
    let mut out = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        let lower = name.as_str();
        if is_hop_by_hop(name) || lower.starts_with("access-control-") || dropped.iter().any(|d| d == lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Headers sent upstream for a client request.
pub fn prepare_upstream_headers(
    client: &HeaderMap,
    config: &ForwardConfig,
    request_id: &str,
    client_ip: Option<IpAddr>,
) -> HeaderMap {
    let dropped = connection_tokens(client);
    let mut out = HeaderMap::with_capacity(client.len() + 2);
    for (name, value) in client {
        let lower = name.as_str();
        let stripped = config
            .strip_request_headers
            .iter()
            .any(|h| h.eq_ignore_ascii_case(lower));
        let origin = !config.pass_through_origin && (name == header::ORIGIN || name == header::REFERER);
        if stripped
            || origin
            || is_hop_by_hop(name)
            || name == header::HOST
            || name == X_REQUEST_ID
            || dropped.iter().any(|d| d == lower)
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    if let Ok(id) = HeaderValue::from_str(request_id) {
        out.insert(X_REQUEST_ID, id);
    }

    if let Some(ip) = client_ip {
        let forwarded = match out.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) if !prior.trim().is_empty() => format!("{}, {}", prior.trim(), ip),
            _ => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            out.insert(X_FORWARDED_FOR, value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_headers() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(header::HOST, HeaderValue::from_static("relay.local"));
        h.insert(header::ORIGIN, HeaderValue::from_static("https://app.test"));
        h.insert(header::REFERER, HeaderValue::from_static("https://app.test/page"));
        h.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        h.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-session-hint"));
        h.insert("x-session-hint", HeaderValue::from_static("abc"));
        h.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        h.insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.1"));
        h.insert(X_REQUEST_ID, HeaderValue::from_static("client-supplied"));
        h
    }

    #[test]
    fn upstream_headers_are_cleaned() {
        let out = prepare_upstream_headers(
            &client_headers(),
            &ForwardConfig::default(),
            "req-1",
            Some("198.51.100.9".parse().unwrap()),
        );
        assert!(out.get(header::HOST).is_none());
        assert!(out.get(header::ORIGIN).is_none());
        assert!(out.get(header::REFERER).is_none());
        assert!(out.get(header::ACCEPT_ENCODING).is_none());
        assert!(out.get(header::CONNECTION).is_none());
        assert!(out.get("x-session-hint").is_none());
        assert_eq!(out[header::ACCEPT], "application/json");
        assert_eq!(out[X_REQUEST_ID], "req-1");
        assert_eq!(out[X_FORWARDED_FOR], "203.0.113.1, 198.51.100.9");
    }

    #[test]
    fn origin_passes_when_configured() {
        let config = ForwardConfig {
            pass_through_origin: true,
            ..Default::default()
        };
        let out = prepare_upstream_headers(&client_headers(), &config, "req-2", None);
        assert_eq!(out[header::ORIGIN], "https://app.test");
        assert_eq!(out[X_FORWARDED_FOR], "203.0.113.1");
    }

    #[test]
    fn response_filter_drops_hop_by_hop_and_cors() {
        let mut upstream = HeaderMap::new();
        upstream.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        upstream.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        upstream.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("https://only.test"));
        upstream.insert(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        upstream.append(header::SET_COOKIE, HeaderValue::from_static("a=1"));
        upstream.append(header::SET_COOKIE, HeaderValue::from_static("b=2"));

        let out = filter_response_headers(&upstream);
        assert_eq!(out[header::CONTENT_TYPE], "text/plain");
        assert!(out.get(header::TRANSFER_ENCODING).is_none());
        assert!(out.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
        assert!(out.get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).is_none());
        assert_eq!(out.get_all(header::SET_COOKIE).iter().count(), 2);
    }
}
