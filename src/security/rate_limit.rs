//! Per-client request counters.
//!
//! Two independent limits, both keyed by normalized client address:
//! a sliding window (previous window weighted by the share of it still
//! inside the window, plus the current window) and a daily quota that
//! starts counting at a client's first request.
//!
//! Limits are passed in on every check so the policy can be swapped
//! without losing counters.

use std::net::IpAddr;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

pub const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy)]
struct Window {
    start: Instant,
    previous: u32,
    current: u32,
}

#[derive(Default)]
pub struct SlidingWindowLimiter {
    windows: DashMap<IpAddr, Window>,
}

impl SlidingWindowLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request. `Err` carries the suggested retry delay.
    pub fn check(&self, ip: IpAddr, window: Duration, max: u32, now: Instant) -> Result<(), Duration> {
        let mut entry = self.windows.entry(ip).or_insert(Window {
            start: now,
            previous: 0,
            current: 0,
        });

        let elapsed = now.saturating_duration_since(entry.start);
        if elapsed >= window * 2 {
            *entry = Window {
                start: now,
                previous: 0,
                current: 0,
            };
        } else if elapsed >= window {
            entry.previous = entry.current;
            entry.current = 0;
            entry.start += window;
        }

        let into_window = now.saturating_duration_since(entry.start).as_secs_f64() / window.as_secs_f64();
        let weighted = f64::from(entry.previous) * (1.0 - into_window).max(0.0) + f64::from(entry.current);
        if weighted >= f64::from(max) {
            return Err(window);
        }
        entry.current += 1;
        Ok(())
    }

    pub fn sweep(&self, window: Duration, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.start) < window * 2);
        before - self.windows.len()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct Usage {
    start: Instant,
    count: u32,
}

#[derive(Default)]
pub struct DailyQuota {
    usage: DashMap<IpAddr, Usage>,
}

impl DailyQuota {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request against a 24 hour quota. `Err` carries the time
    /// until the client's day rolls over.
    pub fn check(&self, ip: IpAddr, limit: u32, now: Instant) -> Result<(), Duration> {
        let mut entry = self.usage.entry(ip).or_insert(Usage { start: now, count: 0 });
        if now.saturating_duration_since(entry.start) >= DAY {
            *entry = Usage { start: now, count: 0 };
        }
        if entry.count >= limit {
            return Err(DAY.saturating_sub(now.saturating_duration_since(entry.start)));
        }
        entry.count += 1;
        Ok(())
    }

    /// Give back one request counted by `check`, for requests a later
    /// limit turned away.
    pub fn refund(&self, ip: IpAddr) {
        if let Some(mut entry) = self.usage.get_mut(&ip) {
            entry.count = entry.count.saturating_sub(1);
        }
    }

    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.usage.len();
        self.usage.retain(|_, u| now.saturating_duration_since(u.start) < DAY);
        before - self.usage.len()
    }

    pub fn len(&self) -> usize {
        self.usage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.usage.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "198.51.100.20".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn window_blocks_after_max_then_recovers() {
        let limiter = SlidingWindowLimiter::new();
        let window = Duration::from_secs(10);
        for _ in 0..3 {
            assert!(limiter.check(ip(), window, 3, Instant::now()).is_ok());
        }
        assert_eq!(limiter.check(ip(), window, 3, Instant::now()), Err(window));

        // Half of the previous window still weighs in: 3 * 0.5 + 1 = 2.5 < 3.
        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(limiter.check(ip(), window, 3, Instant::now()).is_ok());
        assert!(limiter.check(ip(), window, 3, Instant::now()).is_ok());
        assert_eq!(limiter.check(ip(), window, 3, Instant::now()), Err(window));

        tokio::time::advance(Duration::from_secs(30)).await;
        for _ in 0..3 {
            assert!(limiter.check(ip(), window, 3, Instant::now()).is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn clients_are_counted_separately() {
        let limiter = SlidingWindowLimiter::new();
        let window = Duration::from_secs(10);
        let other: IpAddr = "198.51.100.21".parse().unwrap();
        assert!(limiter.check(ip(), window, 1, Instant::now()).is_ok());
        assert!(limiter.check(ip(), window, 1, Instant::now()).is_err());
        assert!(limiter.check(other, window, 1, Instant::now()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn daily_quota_resets_after_a_day() {
        let quota = DailyQuota::new();
        assert!(quota.check(ip(), 2, Instant::now()).is_ok());
        assert!(quota.check(ip(), 2, Instant::now()).is_ok());

        tokio::time::advance(Duration::from_secs(3600)).await;
        let retry = quota.check(ip(), 2, Instant::now()).unwrap_err();
        assert_eq!(retry, DAY - Duration::from_secs(3600));

        tokio::time::advance(DAY).await;
        assert!(quota.check(ip(), 2, Instant::now()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_idle_records() {
        let limiter = SlidingWindowLimiter::new();
        let quota = DailyQuota::new();
        let window = Duration::from_secs(10);
        limiter.check(ip(), window, 5, Instant::now()).unwrap();
        quota.check(ip(), 5, Instant::now()).unwrap();

        tokio::time::advance(Duration::from_secs(25)).await;
        assert_eq!(limiter.sweep(window, Instant::now()), 1);
        assert_eq!(quota.sweep(Instant::now()), 0);
        tokio::time::advance(DAY).await;
        assert_eq!(quota.sweep(Instant::now()), 1);
        assert!(limiter.is_empty() && quota.is_empty());
    }
}
