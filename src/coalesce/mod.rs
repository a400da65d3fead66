//! Request coalescing.
//!
//! # Data Flow
//! ```text
//! cache-eligible miss
//!     → local.rs      first caller per key in this process becomes leader
//!                     later callers follow the leader's flight
//!     → distributed.rs (shared store configured)
//!                     local leader races for the cross-instance lock
//!                     lock held elsewhere → poll cache for the remote result
//!                     no result in time → promote, or fail with 504
//!     → Leadership    forward, store, then finish: resolve local waiters
//!                     and release the distributed lock
//! ```
//!
//! # Design Decisions
//! - At most one upstream fetch per key per process, and per fleet while the
//!   shared store is healthy
//! - Followers never wait longer than the leader's upstream deadline allows
//! - Store failures turn callers into leaders

pub mod distributed;
pub mod local;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::cache::{CacheKey, CachedResponse, ResponseCache};
use crate::config::{CacheBackendKind, ProxyConfig};
use crate::proxy::error::ProxyError;
use crate::resilience::TimeoutBudget;
use crate::store::SharedStore;

pub use distributed::{Acquire, DistributedLease, DistributedLocks};
pub use local::{FlightHandle, LeaderTicket, LocalCoalescer, LocalRole, Outcome};

pub struct Coalescer {
    local: Arc<LocalCoalescer>,
    distributed: Option<Arc<DistributedLocks>>,
    wait_timeout: Duration,
    sweep_interval: Duration,
}

/// The caller's part in a coalesced fetch.
pub enum Enrollment {
    /// Coordinate with the fleet, forward, and finish the flight.
    Leader(Leadership),
    /// Wait for the local leader.
    Follower(FlightHandle),
}

/// What the leader does after fleet coordination.
pub enum Coordination {
    /// Forward upstream; the distributed lock, if any, is held.
    Fetch,
    /// Another instance fetched it already.
    Remote(Arc<CachedResponse>),
}

impl Coalescer {
    pub fn new(config: &ProxyConfig, budget: &TimeoutBudget, store: Option<Arc<dyn SharedStore>>) -> Self {
        // Remote followers poll the cache, so they can only see results
        // kept in the shared store.
        let distributed = match store {
            Some(store) if config.dedupe.distributed && config.cache.backend == CacheBackendKind::Shared => {
                Some(Arc::new(DistributedLocks::new(store, &config.dedupe, budget)))
            }
            Some(_) if config.dedupe.distributed => {
                tracing::warn!("Distributed dedupe needs the shared cache backend, coalescing locally only");
                None
            }
            _ => None,
        };
        Self {
            local: Arc::new(LocalCoalescer::new(budget.local_safety)),
            distributed,
            wait_timeout: budget.dedupe_wait,
            sweep_interval: Duration::from_secs(config.dedupe.sweep_interval_secs),
        }
    }

    pub fn is_distributed(&self) -> bool {
        self.distributed.is_some()
    }

    /// How long a local follower waits on its leader.
    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    pub fn in_flight(&self) -> usize {
        self.local.in_flight()
    }

    /// Join the local flight for `key`, or lead it. Fleet coordination is
    /// left to the leader's `Leadership::coordinate`.
    pub fn enroll(&self, key: &CacheKey) -> Enrollment {
        match self.local.enroll(key) {
            LocalRole::Follower(handle) => Enrollment::Follower(handle),
            LocalRole::Leader(ticket) => Enrollment::Leader(Leadership {
                ticket,
                locks: self.distributed.clone(),
                lease: None,
            }),
        }
    }

    pub fn spawn_sweeper(&self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.local.clone().run_sweeper(self.sweep_interval, shutdown))
    }
}

/// Leadership of one flight: the local ticket plus the distributed lock, if any.
pub struct Leadership {
    ticket: LeaderTicket,
    locks: Option<Arc<DistributedLocks>>,
    lease: Option<DistributedLease>,
}

impl Leadership {
    pub fn key(&self) -> &CacheKey {
        self.ticket.key()
    }

    pub fn subscribe(&self) -> FlightHandle {
        self.ticket.subscribe()
    }

    /// Resolves once nobody is waiting on this flight any more.
    pub fn waiters_gone(&self) -> impl Future<Output = ()> + Send + 'static {
        self.ticket.waiters_gone()
    }

    /// Race the fleet for the distributed lock. When another instance holds
    /// it, poll the cache for its result, then try to promote.
    pub async fn coordinate(&mut self, cache: &ResponseCache) -> Result<Coordination, ProxyError> {
        let Some(locks) = self.locks.clone() else {
            return Ok(Coordination::Fetch);
        };
        let key = self.ticket.key().clone();

        let holder = match locks.acquire(&key).await {
            Acquire::Acquired(lease) => {
                self.lease = Some(lease);
                return Ok(Coordination::Fetch);
            }
            Acquire::Held { holder } => holder,
        };

        tracing::debug!(cache_key = %key, "Waiting on remote leader");
        if let Some(found) = locks.wait_for_result(cache, &key).await {
            return Ok(Coordination::Remote(Arc::new(found)));
        }

        match locks.promote(&key, holder.as_deref()).await {
            Some(lease) => {
                self.lease = Some(lease);
                Ok(Coordination::Fetch)
            }
            None => Err(ProxyError::DedupeTimeout(
                "Request is still being processed elsewhere".to_string(),
            )),
        }
    }

    /// Hand the outcome to every waiter, then release the distributed lock.
    /// Store the response in the cache before calling this so remote
    /// followers find it.
    pub async fn finish(self, outcome: Outcome) {
        self.ticket.resolve(outcome);
        if let Some(lease) = self.lease {
            lease.release().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::store::MemoryStore;
    use axum::http::{HeaderMap, Method, StatusCode};
    use bytes::Bytes;

    fn coalescer(store: Option<Arc<dyn SharedStore>>, wait_ms: u64) -> Coalescer {
        let mut config = ProxyConfig::default();
        config.cache.backend = CacheBackendKind::Shared;
        config.dedupe.wait_timeout_ms = wait_ms;
        config.dedupe.poll_interval_ms = 10;
        let budget = TimeoutBudget::from_config(&config);
        Coalescer::new(&config, &budget, store)
    }

    fn cache() -> ResponseCache {
        ResponseCache::from_config(&CacheConfig::default(), None, "test:").0
    }

    fn key() -> CacheKey {
        CacheKey::new(&Method::GET, "http://upstream.test/item", None)
    }

    fn response(body: &'static [u8]) -> CachedResponse {
        CachedResponse::from_upstream(StatusCode::OK, &HeaderMap::new(), Bytes::from_static(body))
    }

    fn leader(enrollment: Enrollment) -> Leadership {
        match enrollment {
            Enrollment::Leader(l) => l,
            Enrollment::Follower(_) => panic!("expected leader"),
        }
    }

    fn follower(enrollment: Enrollment) -> FlightHandle {
        match enrollment {
            Enrollment::Follower(h) => h,
            Enrollment::Leader(_) => panic!("expected follower"),
        }
    }

    /// What the dispatcher's detached leader task does, minus the upstream.
    async fn lead(mut leadership: Leadership, cache: &ResponseCache, fetched: &'static [u8]) {
        let outcome = match leadership.coordinate(cache).await {
            Ok(Coordination::Fetch) => Ok(Arc::new(response(fetched))),
            Ok(Coordination::Remote(found)) => Ok(found),
            Err(error) => Err(error),
        };
        leadership.finish(outcome).await;
    }

    #[tokio::test]
    async fn local_only_coalescing() {
        let coalescer = coalescer(None, 1_000);
        let cache = cache();
        assert!(!coalescer.is_distributed());

        let mut leadership = leader(coalescer.enroll(&key()));
        let handle = follower(coalescer.enroll(&key()));

        assert!(matches!(leadership.coordinate(&cache).await, Ok(Coordination::Fetch)));
        leadership.finish(Ok(Arc::new(response(b"one")))).await;
        assert_eq!(handle.wait(None).await.unwrap().body, Bytes::from_static(b"one"));
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[test]
    fn distributed_requires_shared_cache_backend() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let config = ProxyConfig::default();
        let budget = TimeoutBudget::from_config(&config);
        assert!(!Coalescer::new(&config, &budget, Some(store.clone())).is_distributed());
        assert!(coalescer(Some(store), 1_000).is_distributed());
    }

    #[tokio::test]
    async fn remote_result_is_picked_up_from_cache() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let first = coalescer(Some(store.clone()), 2_000);
        let second = coalescer(Some(store.clone()), 2_000);
        let cache = Arc::new(cache());

        let mut remote = leader(first.enroll(&key()));
        assert!(matches!(remote.coordinate(&cache).await, Ok(Coordination::Fetch)));

        let writer = cache.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.store(&key(), &response(b"fleet")).await;
            remote.finish(Ok(Arc::new(response(b"fleet")))).await;
        });

        let mut local = leader(second.enroll(&key()));
        match local.coordinate(&cache).await {
            Ok(Coordination::Remote(found)) => assert_eq!(found.body, Bytes::from_static(b"fleet")),
            _ => panic!("expected remote result"),
        }
    }

    #[tokio::test]
    async fn followers_outlive_the_leaders_own_caller() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let first = coalescer(Some(store.clone()), 2_000);
        let second = coalescer(Some(store.clone()), 2_000);
        let cache = Arc::new(cache());

        let mut remote = leader(first.enroll(&key()));
        assert!(matches!(remote.coordinate(&cache).await, Ok(Coordination::Fetch)));

        let leadership = leader(second.enroll(&key()));
        let own = leadership.subscribe();
        let handle = follower(second.enroll(&key()));
        let task_cache = cache.clone();
        let task = tokio::spawn(async move { lead(leadership, &task_cache, b"local").await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(own);

        cache.store(&key(), &response(b"fleet")).await;
        remote.finish(Ok(Arc::new(response(b"fleet")))).await;

        let outcome = handle.wait(Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(outcome.body, Bytes::from_static(b"fleet"));
        task.await.unwrap();
        assert_eq!(second.in_flight(), 0);
    }

    #[tokio::test]
    async fn stalled_remote_leader_is_replaced() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let first = coalescer(Some(store.clone()), 50);
        let second = coalescer(Some(store.clone()), 50);
        let cache = cache();

        let mut stalled = leader(first.enroll(&key()));
        assert!(matches!(stalled.coordinate(&cache).await, Ok(Coordination::Fetch)));

        let mut replacement = leader(second.enroll(&key()));
        assert!(matches!(replacement.coordinate(&cache).await, Ok(Coordination::Fetch)));
    }
}
