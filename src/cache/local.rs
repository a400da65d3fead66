//! In-process LRU cache backend.
//!
//! Bounded by entry count (the LRU capacity) and by stored bytes, where
//! bytes are counted after compression. Entries are `Arc`ed so a read only
//! holds the lock long enough to clone a pointer; decompression happens
//! outside the lock.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tokio::time::Instant;

use crate::cache::entry::{CachedResponse, StoredEntry};
use crate::cache::key::CacheKey;
use crate::cache::snapshot::SnapshotRecord;
use crate::cache::{CacheBackend, CacheStats};
use crate::config::CacheConfig;

struct Slot {
    entry: Arc<StoredEntry>,
    size: usize,
    inserted_at: Instant,
}

struct Inner {
    lru: LruCache<CacheKey, Slot>,
    bytes: usize,
}

pub struct LocalCache {
    inner: Mutex<Inner>,
    ttl: Duration,
    max_bytes: usize,
    compress_threshold: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    raw_bytes: AtomicU64,
    stored_bytes: AtomicU64,
}

impl LocalCache {
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                lru: LruCache::new(capacity),
                bytes: 0,
            }),
            ttl: Duration::from_secs(config.ttl_secs),
            max_bytes: config.max_bytes,
            compress_threshold: config.compress_threshold_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            raw_bytes: AtomicU64::new(0),
            stored_bytes: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetch the stored entry, dropping it if expired.
    fn lookup(&self, key: &CacheKey, promote: bool) -> Option<Arc<StoredEntry>> {
        let now = Instant::now();
        let mut inner = self.lock();
        let slot = if promote {
            inner.lru.get(key)
        } else {
            inner.lru.peek(key)
        }?;

        if now.saturating_duration_since(slot.inserted_at) >= self.ttl {
            if let Some(expired) = inner.lru.pop(key) {
                inner.bytes = inner.bytes.saturating_sub(expired.size);
            }
            return None;
        }
        Some(slot.entry.clone())
    }

    fn decode(&self, key: &CacheKey, entry: &StoredEntry) -> Option<CachedResponse> {
        match entry.decode() {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::warn!(cache_key = %key, error = %e, "Dropping undecodable cache entry");
                let mut inner = self.lock();
                if let Some(bad) = inner.lru.pop(key) {
                    inner.bytes = inner.bytes.saturating_sub(bad.size);
                }
                None
            }
        }
    }

    /// Insert an already encoded entry, evicting as needed.
    fn insert(&self, key: CacheKey, entry: Arc<StoredEntry>, inserted_at: Instant) -> bool {
        let size = entry.size();
        if size > self.max_bytes {
            tracing::debug!(cache_key = %key, size, "Entry larger than cache budget, not stored");
            return false;
        }

        let mut inner = self.lock();
        if let Some(previous) = inner.lru.pop(&key) {
            inner.bytes = inner.bytes.saturating_sub(previous.size);
        }
        while inner.bytes + size > self.max_bytes {
            match inner.lru.pop_lru() {
                Some((_, evicted)) => inner.bytes = inner.bytes.saturating_sub(evicted.size),
                None => break,
            }
        }
        let slot = Slot {
            entry,
            size,
            inserted_at,
        };
        if let Some((_, evicted)) = inner.lru.push(key, slot) {
            inner.bytes = inner.bytes.saturating_sub(evicted.size);
        }
        inner.bytes += size;
        true
    }

    pub fn len(&self) -> usize {
        self.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.lock().bytes
    }

    /// Live entries, least recently used first, for snapshotting.
    pub fn export(&self) -> Vec<SnapshotRecord> {
        let now = Instant::now();
        let inner = self.lock();
        let mut records: Vec<SnapshotRecord> = inner
            .lru
            .iter()
            .filter(|(_, slot)| now.saturating_duration_since(slot.inserted_at) < self.ttl)
            .map(|(key, slot)| SnapshotRecord {
                key: key.as_str().to_string(),
                entry: slot.entry.as_ref().clone(),
            })
            .collect();
        records.reverse();
        records
    }

    /// Load snapshot records, keeping each entry's remaining lifetime.
    /// Returns the number of entries restored.
    pub fn restore(&self, records: Vec<SnapshotRecord>) -> usize {
        let now = Instant::now();
        let mut restored = 0;
        for record in records {
            let age = Duration::from_millis(record.entry.age_ms());
            if age >= self.ttl {
                continue;
            }
            let inserted_at = now.checked_sub(age).unwrap_or(now);
            if self.insert(CacheKey::from(record.key), Arc::new(record.entry), inserted_at) {
                restored += 1;
            }
        }
        restored
    }
}

#[async_trait]
impl CacheBackend for LocalCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &CacheKey) -> Option<CachedResponse> {
        let found = self
            .lookup(key, true)
            .and_then(|entry| self.decode(key, &entry));
        match found {
            Some(response) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(response)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn peek(&self, key: &CacheKey) -> Option<CachedResponse> {
        self.lookup(key, false)
            .and_then(|entry| self.decode(key, &entry))
    }

    async fn set(&self, key: &CacheKey, response: &CachedResponse) {
        let entry = StoredEntry::encode(response, self.compress_threshold);
        let stored = entry.body.len() as u64;
        if self.insert(key.clone(), Arc::new(entry), Instant::now()) {
            self.raw_bytes.fetch_add(response.body.len() as u64, Ordering::Relaxed);
            self.stored_bytes.fetch_add(stored, Ordering::Relaxed);
        }
    }

    async fn clear(&self) {
        let mut inner = self.lock();
        inner.lru.clear();
        inner.bytes = 0;
    }

    async fn stats(&self) -> CacheStats {
        let (entries, bytes) = {
            let inner = self.lock();
            (inner.lru.len() as u64, inner.bytes as u64)
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let raw = self.raw_bytes.load(Ordering::Relaxed);
        let stored = self.stored_bytes.load(Ordering::Relaxed);

        CacheStats {
            backend: self.name(),
            enabled: true,
            entries: Some(entries),
            bytes: Some(bytes),
            max_bytes: Some(self.max_bytes as u64),
            hits: Some(hits),
            misses: Some(misses),
            hit_rate: (hits + misses > 0).then(|| hits as f64 / (hits + misses) as f64),
            compression_ratio: (raw > 0)
                .then(|| ((raw.saturating_sub(stored)) as f64 / raw as f64) * 100.0),
            ttl_secs: self.ttl.as_secs(),
        }
    }
}
