//! Shared key-value store.
//!
//! # Data Flow
//! ```text
//! cache/shared.rs        get / set(ttl) / delete_prefix / count_prefix
//! coalesce/distributed.rs set_if_absent / take_over / delete_if_equals
//!     → SharedStore
//!         redis.rs   redis via ConnectionManager, Lua for atomic compare ops
//!         memory.rs  in-process map with expiry (single node, tests)
//! ```
//!
//! # Design Decisions
//! - Every conditional operation is atomic on the store side
//! - Every call carries its own deadline; callers degrade on any error
//! - Values are opaque bytes; encoding belongs to the caller

pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::SharedStoreConfig;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait SharedStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError>;

    /// Set only if the key does not exist. Returns whether it was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Set `value` if the key is absent or currently holds `expected`.
    /// Returns whether the value now belongs to the caller.
    async fn take_over(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Delete only if the key holds `expected`. Returns whether it was deleted.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Delete every key with the prefix. Returns the number deleted.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError>;

    /// Count keys with the prefix.
    async fn count_prefix(&self, prefix: &str) -> Result<u64, StoreError>;
}

/// Build the configured store, if any.
pub fn from_config(config: &SharedStoreConfig) -> Result<Option<Arc<dyn SharedStore>>, StoreError> {
    match &config.url {
        Some(url) => {
            let store = RedisStore::new(url, Duration::from_millis(config.operation_timeout_ms))?;
            tracing::info!(backend = "redis", "Shared store configured");
            Ok(Some(Arc::new(store)))
        }
        None => Ok(None),
    }
}
