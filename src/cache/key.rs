//! Cache key derivation.

use std::fmt;

use axum::http::Method;
use serde::{Deserialize, Serialize};

/// `{METHOD}:{target}::{accept}` with the Accept header normalized, so
/// requests that differ only in Accept ordering or case share an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(method: &Method, target: &str, accept: Option<&str>) -> Self {
        CacheKey(format!(
            "{}:{}::{}",
            method.as_str(),
            target,
            normalize_accept(accept)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CacheKey {
    fn from(raw: String) -> Self {
        CacheKey(raw)
    }
}

/// Lower-case, split on commas, trim, drop empties, sort, re-join.
pub fn normalize_accept(accept: Option<&str>) -> String {
    let Some(raw) = accept else {
        return "*/*".to_string();
    };
    let mut parts: Vec<String> = raw
        .split(',')
        .map(|part| part.trim().to_ascii_lowercase())
        .filter(|part| !part.is_empty())
        .collect();
    if parts.is_empty() {
        return "*/*".to_string();
    }
    parts.sort();
    parts.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: &str = "https://api.example.com/items?page=1";

    #[test]
    fn accept_order_and_case_do_not_matter() {
        let a = CacheKey::new(&Method::GET, TARGET, Some("text/html, application/json"));
        let b = CacheKey::new(&Method::GET, TARGET, Some("APPLICATION/JSON,text/html"));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), format!("GET:{TARGET}::application/json,text/html"));
    }

    #[test]
    fn missing_accept_is_wildcard() {
        let key = CacheKey::new(&Method::GET, TARGET, None);
        assert!(key.as_str().ends_with("::*/*"));
        assert_eq!(key, CacheKey::new(&Method::GET, TARGET, Some(" , ")));
    }

    #[test]
    fn method_and_target_distinguish_entries() {
        let get = CacheKey::new(&Method::GET, TARGET, None);
        let post = CacheKey::new(&Method::POST, TARGET, None);
        let other = CacheKey::new(&Method::GET, "https://api.example.com/items?page=2", None);
        assert_ne!(get, post);
        assert_ne!(get, other);
    }
}
