//! Timeout budget.
//!
//! Three deadlines nest around every proxied request:
//! ```text
//! client_request  (tower-http TimeoutLayer, whole request)
//!   upstream      (reqwest total timeout, one exchange incl. redirects)
//!   dedupe_wait   (how long a follower waits on a leader)
//! ```
//! A follower must never wait longer than the leader's forward can take, so
//! the dedupe wait is clamped to `upstream + margin`, and the stale in-flight
//! sweep never fires before that bound either.

use std::time::Duration;

use crate::config::ProxyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutBudget {
    pub client_request: Duration,
    pub upstream: Duration,
    pub connect: Duration,
    pub dedupe_wait: Duration,
    pub local_safety: Duration,
    pub lock_ttl: Duration,
}

impl TimeoutBudget {
    pub fn from_config(config: &ProxyConfig) -> Self {
        let upstream = Duration::from_millis(config.timeouts.upstream_ms);
        let bound = upstream + Duration::from_millis(config.timeouts.dedupe_margin_ms);

        let requested_wait = Duration::from_millis(config.dedupe.wait_timeout_ms);
        let dedupe_wait = if requested_wait > bound {
            tracing::warn!(
                requested_ms = config.dedupe.wait_timeout_ms,
                clamped_ms = bound.as_millis() as u64,
                "dedupe.wait_timeout_ms exceeds the upstream deadline, clamping"
            );
            bound
        } else {
            requested_wait
        };

        let local_safety = Duration::from_millis(config.dedupe.local_safety_timeout_ms).max(bound);

        Self {
            client_request: Duration::from_millis(config.timeouts.client_request_ms),
            upstream,
            connect: Duration::from_millis(config.timeouts.connect_ms).min(upstream),
            dedupe_wait,
            local_safety,
            lock_ttl: Duration::from_millis(config.dedupe.lock_ttl_ms),
        }
    }
}
