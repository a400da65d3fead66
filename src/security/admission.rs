//! Admission control for the proxy route.
//!
//! Order per request:
//! ```text
//! whitelist → bypass everything
//! abuse     → blocked or spiking clients rejected
//! daily     → 24 h quota from the client's first request
//! window    → sliding window limiter; a rejection refunds the daily count
//! origin    → blocklisted origins refused, the rest counted
//! ```
//! The policy (limits, whitelist and origin blocklist) lives in an `ArcSwap` and is replaced
//! on config reload; counters survive the swap.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Method, Request},
    middleware::Next,
    response::Response,
};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::{AbuseConfig, ProxyConfig, RateLimitConfig};
use crate::observability::metrics::ProxyStats;
use crate::proxy::error::ProxyError;
use crate::security::abuse::{AbuseMonitor, Verdict};
use crate::security::client_ip;
use crate::security::origin::{request_origin, OriginMonitor, OriginPolicy};
use crate::security::rate_limit::{DailyQuota, SlidingWindowLimiter};
use crate::security::whitelist::Whitelist;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The swappable part of admission control.
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    pub rate: RateLimitConfig,
    pub abuse: AbuseConfig,
    pub whitelist: Whitelist,
    pub origins: OriginPolicy,
    pub trust_forwarded_for: bool,
}

impl AdmissionPolicy {
    /// Build from a validated config. An unparseable whitelist is treated as empty.
    pub fn from_config(config: &ProxyConfig) -> Self {
        let whitelist = Whitelist::parse(&config.rate_limit.whitelist).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Ignoring invalid whitelist");
            Whitelist::default()
        });
        Self {
            rate: config.rate_limit.clone(),
            abuse: config.abuse.clone(),
            whitelist,
            origins: OriginPolicy::from_config(&config.origins),
            trust_forwarded_for: config.listener.trust_forwarded_for,
        }
    }
}

/// Why a request was turned away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: &'static str,
    pub message: &'static str,
    pub retry_after: Duration,
}

impl Rejection {
    pub fn into_error(self) -> ProxyError {
        ProxyError::RateLimited {
            message: self.message.to_string(),
            retry_after_secs: self.retry_after.as_secs_f64().ceil() as u64,
        }
    }
}

pub struct AdmissionControl {
    policy: ArcSwap<AdmissionPolicy>,
    window: SlidingWindowLimiter,
    daily: DailyQuota,
    abuse: AbuseMonitor,
    origins: OriginMonitor,
    stats: Arc<ProxyStats>,
}

impl AdmissionControl {
    pub fn new(policy: AdmissionPolicy, stats: Arc<ProxyStats>) -> Self {
        Self {
            policy: ArcSwap::from_pointee(policy),
            window: SlidingWindowLimiter::new(),
            daily: DailyQuota::new(),
            abuse: AbuseMonitor::new(),
            origins: OriginMonitor::new(),
            stats,
        }
    }

    pub fn policy(&self) -> Arc<AdmissionPolicy> {
        self.policy.load_full()
    }

    pub fn update_policy(&self, policy: AdmissionPolicy) {
        tracing::info!(
            max_requests = policy.rate.max_requests,
            daily_limit = policy.rate.daily_limit,
            whitelist_empty = policy.whitelist.is_empty(),
            auto_block = policy.origins.config.auto_block,
            "Admission policy updated"
        );
        self.policy.store(Arc::new(policy));
    }

    /// Admit or reject one request from `ip`.
    pub fn check(&self, ip: IpAddr, method: &Method) -> Result<(), Rejection> {
        self.check_at(ip, method, Instant::now())
    }

    pub(crate) fn check_at(&self, ip: IpAddr, method: &Method, now: Instant) -> Result<(), Rejection> {
        let policy = self.policy.load();
        if policy.whitelist.contains(ip) {
            return Ok(());
        }

        if policy.abuse.enabled {
            let verdict = self.abuse.check(
                ip,
                policy.abuse.spike_threshold,
                Duration::from_secs(policy.abuse.spike_window_secs),
                Duration::from_secs(policy.abuse.block_minutes * 60),
                now,
            );
            match verdict {
                Verdict::Allowed => {}
                Verdict::Blocked(retry_after) => {
                    return Err(self.reject(Rejection {
                        reason: "abuse_block",
                        message: "Temporarily blocked due to suspicious activity. Please try again later.",
                        retry_after,
                    }))
                }
                Verdict::NewlyBlocked(retry_after) => {
                    return Err(self.reject(Rejection {
                        reason: "abuse_spike",
                        message: "Too many requests. Temporarily blocked.",
                        retry_after,
                    }))
                }
            }
        }

        if !policy.rate.enabled || (policy.rate.skip_options && method == Method::OPTIONS) {
            return Ok(());
        }

        let daily = policy.rate.daily_limit > 0;
        if daily {
            if let Err(retry_after) = self.daily.check(ip, policy.rate.daily_limit, now) {
                return Err(self.reject(Rejection {
                    reason: "daily",
                    message: "Daily request limit exceeded. Please try again tomorrow.",
                    retry_after,
                }));
            }
        }

        let window = Duration::from_millis(policy.rate.window_ms);
        if let Err(retry_after) = self.window.check(ip, window, policy.rate.max_requests, now) {
            if daily {
                self.daily.refund(ip);
            }
            return Err(self.reject(Rejection {
                reason: "window",
                message: "Too many requests. Please slow down and try again later.",
                retry_after,
            }));
        }
        Ok(())
    }

    /// Refuse a blocklisted origin, otherwise count it. `origin` is already
    /// normalized by [`request_origin`].
    pub fn check_origin(&self, origin: &str) -> Result<(), ProxyError> {
        self.check_origin_at(origin, Instant::now())
    }

    pub(crate) fn check_origin_at(&self, origin: &str, now: Instant) -> Result<(), ProxyError> {
        let policy = self.policy.load();
        let origins = &policy.origins;
        if !origins.config.enabled {
            return Ok(());
        }
        if origins.is_blocked(origin) {
            self.stats.record_origin_blocked();
            return Err(ProxyError::OriginBlocked {
                origin: origin.to_string(),
            });
        }
        if origins.config.track_top {
            self.stats.record_origin(origin);
        }
        if origins.config.track_usage {
            self.origins.track(origin, &origins.config, now);
        }
        Ok(())
    }

    fn reject(&self, rejection: Rejection) -> Rejection {
        self.stats.record_rate_limited(rejection.reason);
        rejection
    }

    pub fn sweep(&self) -> usize {
        let policy = self.policy.load();
        let now = Instant::now();
        self.window.sweep(Duration::from_millis(policy.rate.window_ms), now)
            + self.daily.sweep(now)
            + self.abuse.sweep(Duration::from_secs(policy.abuse.spike_window_secs), now)
            + self.origins.sweep(now)
    }

    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let swept = self.sweep();
                    if swept > 0 {
                        tracing::debug!(swept, "Admission records swept");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }
}

/// Middleware for the proxy route. Without connection info the client is
/// treated as the unspecified address.
pub async fn admission_middleware(
    State(admission): State<Arc<AdmissionControl>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
        .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
    let policy = admission.policy();
    let ip = client_ip::resolve(peer, request.headers(), policy.trust_forwarded_for);

    let origin = request_origin(request.headers());

    let verdict = admission
        .check(ip, request.method())
        .map_err(|rejection| {
            tracing::warn!(client = %ip, reason = rejection.reason, "Request rejected by admission control");
            rejection.into_error()
        })
        .and_then(|()| {
            admission.check_origin(&origin).inspect_err(|_| {
                tracing::warn!(client = %ip, origin = %origin, "Request from blocked origin rejected");
            })
        });

    match verdict {
        Ok(()) => next.run(request).await,
        Err(error) => {
            let request_id = request
                .headers()
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown")
                .to_string();
            error.to_response(&request_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(tweak: impl FnOnce(&mut ProxyConfig)) -> AdmissionControl {
        let mut config = ProxyConfig::default();
        tweak(&mut config);
        AdmissionControl::new(AdmissionPolicy::from_config(&config), Arc::new(ProxyStats::new()))
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn window_limit_rejects_with_retry_after() {
        let admission = control(|c| {
            c.rate_limit.max_requests = 2;
            c.rate_limit.window_ms = 10_000;
        });
        let client = ip("198.51.100.1");
        assert!(admission.check(client, &Method::GET).is_ok());
        assert!(admission.check(client, &Method::GET).is_ok());

        let rejection = admission.check(client, &Method::GET).unwrap_err();
        assert_eq!(rejection.reason, "window");
        match rejection.into_error() {
            ProxyError::RateLimited { retry_after_secs, .. } => assert_eq!(retry_after_secs, 10),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(admission.stats.snapshot().rate_limit_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn whitelisted_ranges_bypass_every_check() {
        let admission = control(|c| {
            c.rate_limit.max_requests = 1;
            c.abuse.spike_threshold = 1;
            c.rate_limit.whitelist = vec!["10.0.0.0/8".into(), "192.0.2.5".into()];
        });
        for _ in 0..10 {
            assert!(admission.check(ip("10.9.8.7"), &Method::GET).is_ok());
            assert!(admission.check(ip("192.0.2.5"), &Method::GET).is_ok());
        }
        assert!(admission.check(ip("192.0.2.6"), &Method::GET).is_ok());
        assert!(admission.check(ip("192.0.2.6"), &Method::GET).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn daily_quota_applies_before_window() {
        let admission = control(|c| {
            c.rate_limit.daily_limit = 3;
            c.rate_limit.max_requests = 100;
        });
        let client = ip("198.51.100.2");
        for _ in 0..3 {
            assert!(admission.check(client, &Method::GET).is_ok());
        }
        assert_eq!(admission.check(client, &Method::GET).unwrap_err().reason, "daily");
    }

    #[tokio::test(start_paused = true)]
    async fn window_rejections_do_not_spend_daily_quota() {
        let admission = control(|c| {
            c.rate_limit.daily_limit = 3;
            c.rate_limit.max_requests = 1;
            c.rate_limit.window_ms = 10_000;
        });
        let client = ip("198.51.100.6");
        assert!(admission.check(client, &Method::GET).is_ok());
        for _ in 0..4 {
            assert_eq!(admission.check(client, &Method::GET).unwrap_err().reason, "window");
        }

        for _ in 0..2 {
            tokio::time::advance(Duration::from_secs(20)).await;
            assert!(admission.check(client, &Method::GET).is_ok());
        }
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(admission.check(client, &Method::GET).unwrap_err().reason, "daily");
    }

    #[tokio::test(start_paused = true)]
    async fn abuse_spike_blocks_even_when_rate_limit_disabled() {
        let admission = control(|c| {
            c.rate_limit.enabled = false;
            c.abuse.spike_threshold = 5;
            c.abuse.block_minutes = 1;
        });
        let client = ip("198.51.100.3");
        for _ in 0..5 {
            assert!(admission.check(client, &Method::GET).is_ok());
        }
        assert_eq!(admission.check(client, &Method::GET).unwrap_err().reason, "abuse_spike");
        assert_eq!(admission.check(client, &Method::GET).unwrap_err().reason, "abuse_block");

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(admission.check(client, &Method::GET).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn options_are_not_counted() {
        let admission = control(|c| c.rate_limit.max_requests = 1);
        let client = ip("198.51.100.4");
        for _ in 0..5 {
            assert!(admission.check(client, &Method::OPTIONS).is_ok());
        }
        assert!(admission.check(client, &Method::GET).is_ok());
        assert!(admission.check(client, &Method::GET).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn policy_swap_keeps_counters() {
        let admission = control(|c| c.rate_limit.max_requests = 2);
        let client = ip("198.51.100.5");
        admission.check(client, &Method::GET).unwrap();
        admission.check(client, &Method::GET).unwrap();
        assert!(admission.check(client, &Method::GET).is_err());

        let mut relaxed = ProxyConfig::default();
        relaxed.rate_limit.max_requests = 4;
        admission.update_policy(AdmissionPolicy::from_config(&relaxed));
        assert!(admission.check(client, &Method::GET).is_ok());
        assert!(admission.check(client, &Method::GET).is_ok());
        assert!(admission.check(client, &Method::GET).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn blocklisted_origin_is_refused_and_counted() {
        let admission = control(|c| {
            c.origins.auto_block = true;
            c.origins.block_list = vec!["https://Scraper.Example".into()];
        });

        let error = admission.check_origin("https://scraper.example").unwrap_err();
        assert_eq!(error.status(), axum::http::StatusCode::FORBIDDEN);
        assert_eq!(error.kind(), "origin_blocked");

        assert!(admission.check_origin("https://app.example").is_ok());
        assert!(admission.check_origin("https://app.example").is_ok());
        assert!(admission.check_origin("unknown").is_ok());

        let snapshot = admission.stats.snapshot();
        assert_eq!(snapshot.origin_blocks, 1);
        assert_eq!(snapshot.top_origins[0].origin, "https://app.example");
        assert_eq!(snapshot.top_origins[0].count, 2);
        assert_eq!(admission.origins.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn origin_tracking_can_be_switched_off() {
        let admission = control(|c| {
            c.origins.enabled = false;
            c.origins.auto_block = true;
            c.origins.block_list = vec!["https://scraper.example".into()];
        });
        assert!(admission.check_origin("https://scraper.example").is_ok());
        assert!(admission.stats.snapshot().top_origins.is_empty());
        assert_eq!(admission.origins.len(), 0);
    }
}
