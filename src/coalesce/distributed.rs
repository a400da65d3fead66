//! Cross-instance coalescing through the shared store.
//!
//! Protocol per cache key:
//! ```text
//! acquire   SET lock token NX PX ttl      → leader
//!           else remember current holder  → remote follower
//! follower  poll cache.peek until wait timeout
//! promote   take over only if the lock is absent or still held by the
//!           holder observed at acquire    → leader, else dedupe timeout
//! release   delete only if the lock still holds our token
//! ```
//! Any store error makes the caller a leader; coordination is an
//! optimization, never a reason to fail a request.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::cache::{CacheKey, CachedResponse, ResponseCache};
use crate::config::DedupeConfig;
use crate::resilience::TimeoutBudget;
use crate::store::SharedStore;

pub struct DistributedLocks {
    store: Arc<dyn SharedStore>,
    token: String,
    prefix: String,
    lock_ttl: Duration,
    wait_timeout: Duration,
    poll_interval: Duration,
}

pub enum Acquire {
    Acquired(DistributedLease),
    Held { holder: Option<String> },
}

impl DistributedLocks {
    pub fn new(store: Arc<dyn SharedStore>, config: &DedupeConfig, budget: &TimeoutBudget) -> Self {
        Self {
            store,
            token: uuid::Uuid::new_v4().to_string(),
            prefix: config.key_prefix.clone(),
            lock_ttl: budget.lock_ttl,
            wait_timeout: budget.dedupe_wait,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        }
    }

    /// This instance's lock token.
    pub fn token(&self) -> &str {
        &self.token
    }

    fn lock_key(&self, key: &CacheKey) -> String {
        format!("{}{}", self.prefix, key.as_str())
    }

    fn lease(self: &Arc<Self>, lock_key: String, held: bool) -> DistributedLease {
        DistributedLease {
            locks: self.clone(),
            lock_key,
            held,
        }
    }

    pub async fn acquire(self: &Arc<Self>, key: &CacheKey) -> Acquire {
        let lock_key = self.lock_key(key);
        match self.store.set_if_absent(&lock_key, &self.token, self.lock_ttl).await {
            Ok(true) => Acquire::Acquired(self.lease(lock_key, true)),
            Ok(false) => {
                let holder = match self.store.get(&lock_key).await {
                    Ok(value) => value.map(|v| String::from_utf8_lossy(&v).into_owned()),
                    Err(e) => {
                        tracing::warn!(cache_key = %key, error = %e, "Could not read lock holder");
                        None
                    }
                };
                Acquire::Held { holder }
            }
            Err(e) => {
                tracing::warn!(cache_key = %key, error = %e, "Lock store unavailable, proceeding as leader");
                Acquire::Acquired(self.lease(lock_key, false))
            }
        }
    }

    /// Poll the cache for the remote leader's result until the wait timeout.
    pub async fn wait_for_result(&self, cache: &ResponseCache, key: &CacheKey) -> Option<CachedResponse> {
        let deadline = Instant::now() + self.wait_timeout;
        loop {
            if let Some(found) = cache.peek(key).await {
                return Some(found);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Take over a stalled leader's lock. `None` means someone else did.
    pub async fn promote(self: &Arc<Self>, key: &CacheKey, stale_holder: Option<&str>) -> Option<DistributedLease> {
        let lock_key = self.lock_key(key);
        match self
            .store
            .take_over(&lock_key, stale_holder, &self.token, self.lock_ttl)
            .await
        {
            Ok(true) => {
                tracing::info!(cache_key = %key, "Promoted to leader after remote wait");
                Some(self.lease(lock_key, true))
            }
            Ok(false) => None,
            Err(e) => {
                tracing::warn!(cache_key = %key, error = %e, "Lock store unavailable during promotion, proceeding as leader");
                Some(self.lease(lock_key, false))
            }
        }
    }
}

/// Ownership of a distributed lock. Released explicitly, or from a spawned
/// task when dropped still held.
pub struct DistributedLease {
    locks: Arc<DistributedLocks>,
    lock_key: String,
    held: bool,
}

impl DistributedLease {
    pub fn is_held(&self) -> bool {
        self.held
    }

    pub async fn release(mut self) {
        if self.held {
            self.held = false;
            release(&self.locks, &self.lock_key).await;
        }
    }
}

async fn release(locks: &DistributedLocks, lock_key: &str) {
    match locks.store.delete_if_equals(lock_key, &locks.token).await {
        Ok(true) => {}
        Ok(false) => tracing::debug!(lock = %lock_key, "Lock already expired or taken over"),
        Err(e) => tracing::warn!(lock = %lock_key, error = %e, "Lock release failed, relying on TTL"),
    }
}

impl Drop for DistributedLease {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let locks = self.locks.clone();
            let lock_key = std::mem::take(&mut self.lock_key);
            handle.spawn(async move { release(&locks, &lock_key).await });
        }
    }
}
