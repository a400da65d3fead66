//! Traffic spike detection.
//!
//! Counts requests per client in a fixed spike window. A client that goes
//! over the threshold is blocked outright for the configured duration,
//! independent of the regular rate limits.

use std::net::IpAddr;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Record {
    count: u32,
    first_seen: Instant,
    blocked_until: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    /// Already blocked; retry after the remaining block time.
    Blocked(Duration),
    /// This request crossed the threshold and started a block.
    NewlyBlocked(Duration),
}

#[derive(Default)]
pub struct AbuseMonitor {
    records: DashMap<IpAddr, Record>,
}

impl AbuseMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, ip: IpAddr, threshold: u32, window: Duration, block: Duration, now: Instant) -> Verdict {
        let mut record = self.records.entry(ip).or_insert(Record {
            count: 0,
            first_seen: now,
            blocked_until: None,
        });

        if let Some(until) = record.blocked_until.filter(|until| *until > now) {
            return Verdict::Blocked(until - now);
        }

        if record.blocked_until.is_some() || now.saturating_duration_since(record.first_seen) > window {
            *record = Record {
                count: 0,
                first_seen: now,
                blocked_until: None,
            };
        }

        record.count += 1;
        if record.count > threshold {
            record.blocked_until = Some(now + block);
            tracing::error!(
                client = %ip,
                count = record.count,
                threshold,
                "Abuse detected, client temporarily blocked"
            );
            return Verdict::NewlyBlocked(block);
        }
        Verdict::Allowed
    }

    pub fn is_blocked(&self, ip: IpAddr, now: Instant) -> bool {
        self.records
            .get(&ip)
            .and_then(|r| r.blocked_until)
            .is_some_and(|until| until > now)
    }

    pub fn sweep(&self, window: Duration, now: Instant) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| {
            let blocked = r.blocked_until.is_some_and(|until| until > now);
            blocked || now.saturating_duration_since(r.first_seen) <= window
        });
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);
    const BLOCK: Duration = Duration::from_secs(15 * 60);

    fn ip() -> IpAddr {
        "203.0.113.50".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn spike_triggers_block() {
        let monitor = AbuseMonitor::new();
        for _ in 0..3 {
            assert_eq!(monitor.check(ip(), 3, WINDOW, BLOCK, Instant::now()), Verdict::Allowed);
        }
        assert_eq!(
            monitor.check(ip(), 3, WINDOW, BLOCK, Instant::now()),
            Verdict::NewlyBlocked(BLOCK)
        );
        assert!(monitor.is_blocked(ip(), Instant::now()));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(
            monitor.check(ip(), 3, WINDOW, BLOCK, Instant::now()),
            Verdict::Blocked(BLOCK - Duration::from_secs(60))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn block_expires_and_counting_restarts() {
        let monitor = AbuseMonitor::new();
        for _ in 0..4 {
            monitor.check(ip(), 3, WINDOW, BLOCK, Instant::now());
        }
        tokio::time::advance(BLOCK).await;
        assert!(!monitor.is_blocked(ip(), Instant::now()));
        assert_eq!(monitor.check(ip(), 3, WINDOW, BLOCK, Instant::now()), Verdict::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn steady_traffic_below_threshold_is_fine() {
        let monitor = AbuseMonitor::new();
        for _ in 0..10 {
            for _ in 0..3 {
                assert_eq!(monitor.check(ip(), 3, WINDOW, BLOCK, Instant::now()), Verdict::Allowed);
            }
            tokio::time::advance(WINDOW + Duration::from_secs(1)).await;
        }
        assert_eq!(monitor.sweep(WINDOW, Instant::now()), 1);
    }
}
