//! Cache backend over the shared store.
//!
//! Entries are bincode-encoded `StoredEntry` values written with the store's
//! native TTL, so every instance sees the same cache. Hit and miss counters
//! would only describe this process, so they are not reported.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::entry::{CachedResponse, StoredEntry};
use crate::cache::key::CacheKey;
use crate::cache::{CacheBackend, CacheStats};
use crate::config::CacheConfig;
use crate::store::SharedStore;

pub struct SharedCache {
    store: Arc<dyn SharedStore>,
    prefix: String,
    ttl: Duration,
    compress_threshold: usize,
}

impl SharedCache {
    pub fn new(store: Arc<dyn SharedStore>, config: &CacheConfig, prefix: &str) -> Self {
        Self {
            store,
            prefix: prefix.to_string(),
            ttl: Duration::from_secs(config.ttl_secs),
            compress_threshold: config.compress_threshold_bytes,
        }
    }

    fn store_key(&self, key: &CacheKey) -> String {
        format!("{}{}", self.prefix, key.as_str())
    }

    async fn fetch(&self, key: &CacheKey) -> Option<CachedResponse> {
        let raw = match self.store.get(&self.store_key(key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(cache_key = %key, error = %e, "Shared cache read failed, treating as miss");
                return None;
            }
        };
        let decoded = bincode::serde::decode_from_slice::<StoredEntry, _>(&raw, bincode::config::standard())
            .map_err(|e| e.to_string())
            .and_then(|(entry, _)| entry.decode().map_err(|e| e.to_string()));
        match decoded {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::warn!(cache_key = %key, error = %e, "Undecodable shared cache entry");
                None
            }
        }
    }
}

#[async_trait]
impl CacheBackend for SharedCache {
    fn name(&self) -> &'static str {
        "shared"
    }

    async fn get(&self, key: &CacheKey) -> Option<CachedResponse> {
        self.fetch(key).await
    }

    async fn peek(&self, key: &CacheKey) -> Option<CachedResponse> {
        self.fetch(key).await
    }

    async fn set(&self, key: &CacheKey, response: &CachedResponse) {
        let entry = StoredEntry::encode(response, self.compress_threshold);
        let bytes = match bincode::serde::encode_to_vec(&entry, bincode::config::standard()) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(cache_key = %key, error = %e, "Failed to encode cache entry");
                return;
            }
        };
        if let Err(e) = self.store.set(&self.store_key(key), &bytes, self.ttl).await {
            tracing::warn!(cache_key = %key, error = %e, "Shared cache write failed");
        }
    }

    async fn clear(&self) {
        match self.store.delete_prefix(&self.prefix).await {
            Ok(count) => tracing::info!(count, "Shared cache cleared"),
            Err(e) => tracing::warn!(error = %e, "Shared cache clear failed"),
        }
    }

    async fn stats(&self) -> CacheStats {
        let entries = match self.store.count_prefix(&self.prefix).await {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::debug!(error = %e, "Shared cache entry count unavailable");
                None
            }
        };
        CacheStats {
            backend: self.name(),
            enabled: true,
            entries,
            ttl_secs: self.ttl.as_secs(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
    use bytes::Bytes;

    fn shared(store: Arc<MemoryStore>) -> SharedCache {
        SharedCache::new(store, &CacheConfig::default(), "test:cache:")
    }

    #[tokio::test]
    async fn entries_are_visible_to_every_instance() {
        let store = Arc::new(MemoryStore::new());
        let a = shared(store.clone());
        let b = shared(store.clone());

        let key = CacheKey::new(&Method::GET, "http://upstream.test/doc", None);
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        let response = CachedResponse::from_upstream(StatusCode::OK, &headers, Bytes::from("[1,2,3]".repeat(500)));

        a.set(&key, &response).await;
        assert_eq!(b.get(&key).await.unwrap(), response);
        assert_eq!(b.stats().await.entries, Some(1));
        assert_eq!(b.stats().await.hits, None);

        b.clear().await;
        assert!(a.peek(&key).await.is_none());
    }

    #[tokio::test]
    async fn garbage_values_read_as_miss() {
        let store = Arc::new(MemoryStore::new());
        let cache = shared(store.clone());
        let key = CacheKey::new(&Method::GET, "http://upstream.test/bad", None);
        store
            .set(&cache.store_key(&key), b"\x00\x01garbage", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(cache.get(&key).await.is_none());
    }
}
