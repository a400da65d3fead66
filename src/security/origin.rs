//! Calling-origin monitoring.
//!
//! Every proxied request is attributed to its `Origin` header (lowercased,
//! "unknown" when absent). Origins on the blocklist are refused when
//! auto-blocking is on; everything else is counted over a rolling day and
//! logged once when it crosses the warn and alert thresholds.

use std::collections::HashSet;

use axum::http::{header, HeaderMap};
use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::OriginConfig;
use crate::security::rate_limit::DAY;

const UNKNOWN: &str = "unknown";
const MAX_USAGE_RECORDS: usize = 10_000;

/// Origin settings with the blocklist normalized for lookups.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    pub config: OriginConfig,
    blocked: HashSet<String>,
}

impl OriginPolicy {
    pub fn from_config(config: &OriginConfig) -> Self {
        let blocked = config
            .block_list
            .iter()
            .map(|origin| origin.trim().to_ascii_lowercase())
            .filter(|origin| !origin.is_empty())
            .collect();
        Self {
            config: config.clone(),
            blocked,
        }
    }

    pub fn is_blocked(&self, origin: &str) -> bool {
        self.config.auto_block && self.blocked.contains(origin)
    }
}

/// The caller's origin as tracked: lowercased, or "unknown".
pub fn request_origin(headers: &HeaderMap) -> String {
    headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map_or_else(|| UNKNOWN.to_string(), str::to_ascii_lowercase)
}

#[derive(Debug, Clone, Copy)]
struct Usage {
    count: u64,
    day_started: Instant,
    warned: bool,
    alerted: bool,
}

#[derive(Default)]
pub struct OriginMonitor {
    usage: DashMap<String, Usage>,
}

impl OriginMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request from `origin` and return its count for the current day.
    /// New origins are not tracked once the table is full.
    pub fn track(&self, origin: &str, config: &OriginConfig, now: Instant) -> Option<u64> {
        if !self.usage.contains_key(origin) && self.usage.len() >= MAX_USAGE_RECORDS {
            return None;
        }
        let mut usage = self.usage.entry(origin.to_string()).or_insert(Usage {
            count: 0,
            day_started: now,
            warned: false,
            alerted: false,
        });

        if now.saturating_duration_since(usage.day_started) >= DAY {
            *usage = Usage {
                count: 0,
                day_started: now,
                warned: false,
                alerted: false,
            };
        }

        usage.count += 1;
        if usage.count >= config.alert_threshold && !usage.alerted {
            usage.alerted = true;
            usage.warned = true;
            tracing::error!(
                origin,
                count = usage.count,
                threshold = config.alert_threshold,
                "Origin exceeded daily alert threshold"
            );
        } else if usage.count >= config.warn_threshold && !usage.warned {
            usage.warned = true;
            tracing::warn!(
                origin,
                count = usage.count,
                threshold = config.warn_threshold,
                "Origin exceeded daily warn threshold"
            );
        }
        Some(usage.count)
    }

    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.usage.len();
        self.usage
            .retain(|_, usage| now.saturating_duration_since(usage.day_started) < DAY);
        before - self.usage.len()
    }

    pub fn len(&self) -> usize {
        self.usage.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::time::Duration;

    fn thresholds(warn: u64, alert: u64) -> OriginConfig {
        OriginConfig {
            warn_threshold: warn,
            alert_threshold: alert,
            ..OriginConfig::default()
        }
    }

    #[test]
    fn origin_header_is_lowercased_or_unknown() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_origin(&headers), "unknown");

        headers.insert(header::ORIGIN, HeaderValue::from_static("HTTPS://App.Example"));
        assert_eq!(request_origin(&headers), "https://app.example");
    }

    #[test]
    fn blocklist_only_applies_with_auto_block() {
        let mut config = OriginConfig {
            block_list: vec![" https://Bad.Example ".into()],
            ..OriginConfig::default()
        };
        assert!(!OriginPolicy::from_config(&config).is_blocked("https://bad.example"));

        config.auto_block = true;
        let policy = OriginPolicy::from_config(&config);
        assert!(policy.is_blocked("https://bad.example"));
        assert!(!policy.is_blocked("https://good.example"));
    }

    #[tokio::test(start_paused = true)]
    async fn daily_counts_roll_over() {
        let monitor = OriginMonitor::new();
        let config = thresholds(2, 3);
        let now = Instant::now();
        for expected in 1..=4 {
            assert_eq!(monitor.track("https://a.example", &config, now), Some(expected));
        }

        let later = now + DAY + Duration::from_secs(1);
        assert_eq!(monitor.track("https://a.example", &config, later), Some(1));
        assert_eq!(monitor.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_stale_days() {
        let monitor = OriginMonitor::new();
        let config = OriginConfig::default();
        let now = Instant::now();
        monitor.track("https://old.example", &config, now);
        monitor.track("https://new.example", &config, now + DAY / 2);

        assert_eq!(monitor.sweep(now + DAY), 1);
        assert_eq!(monitor.len(), 1);
    }
}
