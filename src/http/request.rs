//! Request-side helpers for the proxy route.
//!
//! # Responsibilities
//! - Parse the proxy query (`url`, `refresh`)
//! - Read the request id set by the request-id layer

use axum::http::HeaderMap;

use crate::proxy::headers::X_REQUEST_ID;

/// Query parameters understood by the proxy route.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyQuery {
    pub target: Option<String>,
    pub refresh: bool,
}

impl ProxyQuery {
    /// Parse a raw query string. The first `url` wins; `refresh` is true for
    /// `true` or `1`.
    pub fn parse(query: Option<&str>) -> Self {
        let mut parsed = Self::default();
        let Some(query) = query else {
            return parsed;
        };
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match name.as_ref() {
                "url" if parsed.target.is_none() => parsed.target = Some(value.into_owned()),
                "refresh" => parsed.refresh = matches!(value.as_ref(), "true" | "1"),
                _ => {}
            }
        }
        parsed
    }
}

/// The request id, or "unknown" when the layer did not run.
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}
