//! Local in-flight map.
//!
//! One entry per cache key while a leader is forwarding. Each entry holds a
//! `watch` sender; followers subscribe and wait for the leader's outcome.
//! The leader's `LeaderTicket` always settles the entry: explicitly through
//! `resolve`, or with an error when it is dropped unresolved.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use crate::cache::{CacheKey, CachedResponse};
use crate::proxy::error::ProxyError;

/// What every waiter of a flight receives.
pub type Outcome = Result<Arc<CachedResponse>, ProxyError>;

type Slot = watch::Sender<Option<Outcome>>;

struct Flight {
    id: u64,
    started: Instant,
    tx: Arc<Slot>,
}

pub struct LocalCoalescer {
    flights: Mutex<HashMap<CacheKey, Flight>>,
    next_id: AtomicU64,
    safety_timeout: Duration,
}

pub enum LocalRole {
    Leader(LeaderTicket),
    Follower(FlightHandle),
}

impl LocalCoalescer {
    pub fn new(safety_timeout: Duration) -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            safety_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Flight>> {
        self.flights.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join the flight for `key`, or start one and become its leader.
    pub fn enroll(self: &Arc<Self>, key: &CacheKey) -> LocalRole {
        let mut flights = self.lock();
        if let Some(flight) = flights.get(key) {
            return LocalRole::Follower(FlightHandle {
                rx: flight.tx.subscribe(),
            });
        }

        let (tx, _) = watch::channel(None);
        let tx = Arc::new(tx);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        flights.insert(
            key.clone(),
            Flight {
                id,
                started: Instant::now(),
                tx: tx.clone(),
            },
        );
        LocalRole::Leader(LeaderTicket {
            coalescer: self.clone(),
            key: key.clone(),
            tx,
            id,
            settled: false,
        })
    }

    fn remove(&self, key: &CacheKey, id: u64) {
        let mut flights = self.lock();
        if flights.get(key).is_some_and(|f| f.id == id) {
            flights.remove(key);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    /// Reject and drop flights older than the safety timeout.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<(CacheKey, Arc<Slot>)> = {
            let mut flights = self.lock();
            let keys: Vec<CacheKey> = flights
                .iter()
                .filter(|(_, f)| now.saturating_duration_since(f.started) >= self.safety_timeout)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| flights.remove(&k).map(|f| (k, f.tx)))
                .collect()
        };

        for (key, tx) in &stale {
            tracing::warn!(cache_key = %key, "Rejecting stale in-flight request");
            tx.send_replace(Some(Err(ProxyError::DedupeTimeout(
                "In-flight request expired before completing".to_string(),
            ))));
        }
        stale.len()
    }

    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let swept = self.sweep();
                    if swept > 0 {
                        tracing::info!(swept, "In-flight sweep finished");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }
}

/// Held by the leader of a flight.
pub struct LeaderTicket {
    coalescer: Arc<LocalCoalescer>,
    key: CacheKey,
    tx: Arc<Slot>,
    id: u64,
    settled: bool,
}

impl LeaderTicket {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// A receiver for the leader's own caller.
    pub fn subscribe(&self) -> FlightHandle {
        FlightHandle {
            rx: self.tx.subscribe(),
        }
    }

    /// Resolves once nobody is waiting on this flight any more.
    pub fn waiters_gone(&self) -> impl Future<Output = ()> + Send + 'static {
        let tx = self.tx.clone();
        async move { tx.closed().await }
    }

    pub fn resolve(mut self, outcome: Outcome) {
        self.settle(outcome);
    }

    fn settle(&mut self, outcome: Outcome) {
        if self.settled {
            return;
        }
        self.settled = true;
        self.coalescer.remove(&self.key, self.id);
        self.tx.send_replace(Some(outcome));
    }
}

impl Drop for LeaderTicket {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(cache_key = %self.key, "Leader dropped without a result");
            self.settle(Err(ProxyError::Internal(
                "In-flight request was abandoned by its leader".to_string(),
            )));
        }
    }
}

/// Waits for a flight's outcome.
pub struct FlightHandle {
    rx: watch::Receiver<Option<Outcome>>,
}

impl FlightHandle {
    /// Wait for the outcome, up to `timeout` when given.
    pub async fn wait(mut self, timeout: Option<Duration>) -> Outcome {
        let waited = match timeout {
            Some(limit) => match tokio::time::timeout(limit, self.rx.wait_for(Option::is_some)).await {
                Ok(result) => result.map(|value| (*value).clone()),
                Err(_) => {
                    return Err(ProxyError::DedupeTimeout(
                        "Timed out waiting for in-flight request".to_string(),
                    ))
                }
            },
            None => self.rx.wait_for(Option::is_some).await.map(|value| (*value).clone()),
        };
        match waited {
            Ok(Some(outcome)) => outcome,
            _ => Err(ProxyError::Internal("In-flight request vanished".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, Method, StatusCode};
    use bytes::Bytes;

    fn key() -> CacheKey {
        CacheKey::new(&Method::GET, "http://upstream.test/slow", None)
    }

    fn ok() -> Outcome {
        Ok(Arc::new(CachedResponse::from_upstream(
            StatusCode::OK,
            &HeaderMap::new(),
            Bytes::from_static(b"done"),
        )))
    }

    fn leader(role: LocalRole) -> LeaderTicket {
        match role {
            LocalRole::Leader(t) => t,
            LocalRole::Follower(_) => panic!("expected leader"),
        }
    }

    fn follower(role: LocalRole) -> FlightHandle {
        match role {
            LocalRole::Follower(h) => h,
            LocalRole::Leader(_) => panic!("expected follower"),
        }
    }

    #[tokio::test]
    async fn one_leader_many_followers_share_outcome() {
        let coalescer = Arc::new(LocalCoalescer::new(Duration::from_secs(60)));
        let ticket = leader(coalescer.enroll(&key()));
        let waiters: Vec<_> = (0..5)
            .map(|_| follower(coalescer.enroll(&key())))
            .map(|h| tokio::spawn(h.wait(Some(Duration::from_secs(5)))))
            .collect();

        ticket.resolve(ok());
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap().body, Bytes::from_static(b"done"));
        }
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn failures_reach_followers() {
        let coalescer = Arc::new(LocalCoalescer::new(Duration::from_secs(60)));
        let ticket = leader(coalescer.enroll(&key()));
        let handle = follower(coalescer.enroll(&key()));

        ticket.resolve(Err(ProxyError::UpstreamTimeout("slow".into())));
        assert_eq!(
            handle.wait(None).await.unwrap_err(),
            ProxyError::UpstreamTimeout("slow".into())
        );
    }

    #[tokio::test]
    async fn dropped_leader_never_strands_followers() {
        let coalescer = Arc::new(LocalCoalescer::new(Duration::from_secs(60)));
        let ticket = leader(coalescer.enroll(&key()));
        let handle = follower(coalescer.enroll(&key()));

        drop(ticket);
        assert!(matches!(handle.wait(None).await, Err(ProxyError::Internal(_))));
        assert!(matches!(coalescer.enroll(&key()), LocalRole::Leader(_)));
    }

    #[tokio::test]
    async fn late_subscriber_sees_settled_outcome() {
        let coalescer = Arc::new(LocalCoalescer::new(Duration::from_secs(60)));
        let ticket = leader(coalescer.enroll(&key()));
        let own = ticket.subscribe();
        ticket.resolve(ok());
        assert!(own.wait(None).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn follower_times_out() {
        let coalescer = Arc::new(LocalCoalescer::new(Duration::from_secs(60)));
        let _ticket = leader(coalescer.enroll(&key()));
        let handle = follower(coalescer.enroll(&key()));

        let result = handle.wait(Some(Duration::from_millis(100))).await;
        assert!(matches!(result, Err(ProxyError::DedupeTimeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_rejects_stale_flights() {
        let coalescer = Arc::new(LocalCoalescer::new(Duration::from_secs(10)));
        let ticket = leader(coalescer.enroll(&key()));
        let handle = follower(coalescer.enroll(&key()));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(coalescer.sweep(), 0);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(coalescer.sweep(), 1);

        assert!(matches!(handle.wait(None).await, Err(ProxyError::DedupeTimeout(_))));
        assert!(matches!(coalescer.enroll(&key()), LocalRole::Leader(_)));
        drop(ticket);
    }

    #[tokio::test]
    async fn waiters_gone_fires_when_every_receiver_drops() {
        let coalescer = Arc::new(LocalCoalescer::new(Duration::from_secs(60)));
        let ticket = leader(coalescer.enroll(&key()));
        let own = ticket.subscribe();
        let other = follower(coalescer.enroll(&key()));

        drop(own);
        let gone = tokio::time::timeout(Duration::from_millis(50), ticket.waiters_gone()).await;
        assert!(gone.is_err());

        drop(other);
        tokio::time::timeout(Duration::from_secs(1), ticket.waiters_gone())
            .await
            .unwrap();
    }
}
