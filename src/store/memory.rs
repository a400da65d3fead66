//! In-process shared store.
//!
//! Same semantics as the redis store, scoped to one process. Several
//! coalescers sharing one `MemoryStore` behave like instances sharing redis.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::store::{SharedStore, StoreError};

struct Value {
    data: Vec<u8>,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Live value for `key`, dropping it if expired.
fn live<'a>(entries: &'a mut HashMap<String, Value>, key: &str, now: Instant) -> Option<&'a Value> {
    if entries.get(key).is_some_and(|v| v.expires_at <= now) {
        entries.remove(key);
    }
    entries.get(key)
}

#[async_trait]
impl SharedStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut entries = self.lock();
        Ok(live(&mut entries, key, Instant::now()).map(|v| v.data.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        self.lock().insert(
            key.to_string(),
            Value {
                data: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.lock();
        if live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Value {
                data: value.as_bytes().to_vec(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn take_over(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.lock();
        let allowed = match live(&mut entries, key, now) {
            None => true,
            Some(current) => expected.is_some_and(|e| current.data == e.as_bytes()),
        };
        if allowed {
            entries.insert(
                key.to_string(),
                Value {
                    data: value.as_bytes().to_vec(),
                    expires_at: now + ttl,
                },
            );
        }
        Ok(allowed)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut entries = self.lock();
        let matches = live(&mut entries, key, Instant::now())
            .is_some_and(|v| v.data == expected.as_bytes());
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok((before - entries.len()) as u64)
    }

    async fn count_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let now = Instant::now();
        Ok(self
            .lock()
            .iter()
            .filter(|(k, v)| k.starts_with(prefix) && v.expires_at > now)
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn set_if_absent_is_exclusive() {
        let store = MemoryStore::new();
        assert!(store.set_if_absent("lock", "a", TTL).await.unwrap());
        assert!(!store.set_if_absent("lock", "b", TTL).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn values_expire() {
        let store = MemoryStore::new();
        store.set("k", b"v", TTL).await.unwrap();
        tokio::time::advance(TTL).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_if_absent("k", "w", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn take_over_requires_observed_holder() {
        let store = MemoryStore::new();
        store.set_if_absent("lock", "stale", TTL).await.unwrap();

        assert!(!store.take_over("lock", Some("other"), "me", TTL).await.unwrap());
        assert!(!store.take_over("lock", None, "me", TTL).await.unwrap());
        assert!(store.take_over("lock", Some("stale"), "me", TTL).await.unwrap());
        assert!(!store.take_over("lock", Some("stale"), "you", TTL).await.unwrap());

        store.delete_if_equals("lock", "me").await.unwrap();
        assert!(store.take_over("lock", Some("stale"), "you", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn delete_if_equals_spares_other_holders() {
        let store = MemoryStore::new();
        store.set_if_absent("lock", "a", TTL).await.unwrap();
        assert!(!store.delete_if_equals("lock", "b").await.unwrap());
        assert!(store.delete_if_equals("lock", "a").await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), None);
    }

    #[tokio::test]
    async fn prefix_operations() {
        let store = MemoryStore::new();
        store.set("cache:a", b"1", TTL).await.unwrap();
        store.set("cache:b", b"2", TTL).await.unwrap();
        store.set("lock:a", b"3", TTL).await.unwrap();

        assert_eq!(store.count_prefix("cache:").await.unwrap(), 2);
        assert_eq!(store.delete_prefix("cache:").await.unwrap(), 2);
        assert_eq!(store.count_prefix("cache:").await.unwrap(), 0);
        assert_eq!(store.count_prefix("lock:").await.unwrap(), 1);
    }
}
