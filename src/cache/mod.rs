//! Response cache subsystem.
//!
//! # Data Flow
//! ```text
//! Request (cache-eligible GET):
//!     → key.rs (METHOD:target::normalized-accept)
//!     → ResponseCache::get → backend
//!         local.rs   LRU bounded by entries and compressed bytes
//!         shared.rs  entries in the shared store with native TTL
//!
//! Upstream 2xx response:
//!     → entry.rs (storability gate, header filtering)
//!     → compression.rs (gzip above threshold)
//!     → ResponseCache::store → backend
//!
//! Side channel (local backend only):
//!     snapshot.rs periodically writes the LRU to disk, reloads at startup
//! ```
//!
//! # Design Decisions
//! - Backends sit behind one async trait so the pipeline never knows which is active
//! - Backend failures degrade to a miss, never to a failed request
//! - TTL is fixed at write time; reads never extend it

pub mod compression;
pub mod entry;
pub mod key;
pub mod local;
pub mod shared;
pub mod snapshot;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{CacheBackendKind, CacheConfig};
use crate::store::SharedStore;

pub use entry::{BypassReason, CacheDecision, CachedResponse, StoredEntry};
pub use key::CacheKey;
pub use local::LocalCache;
pub use shared::SharedCache;

/// Storage behind the response cache.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Look up an entry, counting a hit or miss.
    async fn get(&self, key: &CacheKey) -> Option<CachedResponse>;

    /// Look up an entry without touching recency or counters.
    async fn peek(&self, key: &CacheKey) -> Option<CachedResponse>;

    async fn set(&self, key: &CacheKey, response: &CachedResponse);

    async fn clear(&self);

    async fn stats(&self) -> CacheStats;
}

/// Point-in-time cache statistics. Fields a backend cannot know are `None`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub backend: &'static str,
    pub enabled: bool,
    pub entries: Option<u64>,
    pub bytes: Option<u64>,
    pub max_bytes: Option<u64>,
    pub hits: Option<u64>,
    pub misses: Option<u64>,
    pub hit_rate: Option<f64>,
    /// Percentage of body bytes saved by compression.
    pub compression_ratio: Option<f64>,
    pub ttl_secs: u64,
}

/// The cache as seen by the dispatch pipeline.
pub struct ResponseCache {
    backend: Arc<dyn CacheBackend>,
    enabled: bool,
    max_body_bytes: usize,
}

impl ResponseCache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self {
            backend,
            enabled: config.enabled,
            max_body_bytes: config.max_body_bytes,
        }
    }

    /// Build the configured backend. The local cache is returned separately
    /// so the snapshot task can reach it.
    pub fn from_config(
        config: &CacheConfig,
        store: Option<Arc<dyn SharedStore>>,
        cache_prefix: &str,
    ) -> (Self, Option<Arc<LocalCache>>) {
        match (config.backend, store) {
            (CacheBackendKind::Shared, Some(store)) => {
                let shared = Arc::new(SharedCache::new(store, config, cache_prefix));
                (Self::new(shared, config), None)
            }
            (kind, _) => {
                if kind == CacheBackendKind::Shared {
                    tracing::warn!("Shared cache requested without a shared store, using memory");
                }
                let local = Arc::new(LocalCache::new(config));
                (Self::new(local.clone(), config), Some(local))
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    pub async fn get(&self, key: &CacheKey) -> Option<CachedResponse> {
        if !self.enabled {
            return None;
        }
        self.backend.get(key).await
    }

    pub async fn peek(&self, key: &CacheKey) -> Option<CachedResponse> {
        if !self.enabled {
            return None;
        }
        self.backend.peek(key).await
    }

    /// Store a response that already passed the storability gate.
    /// Bodies above `max_body_bytes` are refused.
    pub async fn store(&self, key: &CacheKey, response: &CachedResponse) -> bool {
        if !self.enabled || response.body.len() > self.max_body_bytes {
            return false;
        }
        self.backend.set(key, response).await;
        true
    }

    pub async fn clear(&self) {
        self.backend.clear().await;
    }

    pub async fn stats(&self) -> CacheStats {
        let mut stats = self.backend.stats().await;
        stats.enabled = self.enabled;
        stats
    }
}
