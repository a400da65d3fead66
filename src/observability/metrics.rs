//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Keep an in-process snapshot for the JSON `/metrics` endpoint
//! - Emit the same events through the `metrics` facade
//! - Install and render the Prometheus recorder
//!
//! # Metrics
//! - `relay_requests_total` (counter): by method, status
//! - `relay_request_duration_seconds` (histogram): end-to-end latency
//! - `relay_cache_events_total` (counter): hit, miss, bypass, dedupe, error
//! - `relay_rate_limited_total` (counter): by reason
//! - `relay_circuit_transitions_total` (counter): by target state
//! - `relay_origin_blocked_total` (counter): requests refused by Origin
//!
//! # Design Decisions
//! - Facade calls are no-ops until a recorder is installed
//! - Latency percentiles come from a bounded ring buffer, not the histogram
//! - Top targets and origins are pruned in batches once a map outgrows its bound

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

const LATENCY_SAMPLES: usize = 10_000;
const MAX_TRACKED_TARGETS: usize = 200;
const TOP_TARGETS: usize = 10;
const MAX_TRACKED_ORIGINS: usize = 5_000;
const TOP_ORIGINS: usize = 10;

const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Cache interaction seen by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    Hit,
    Miss,
    Bypass,
    Dedupe,
    Error,
}

impl CacheEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheEvent::Hit => "hit",
            CacheEvent::Miss => "miss",
            CacheEvent::Bypass => "bypass",
            CacheEvent::Dedupe => "dedupe",
            CacheEvent::Error => "error",
        }
    }
}

/// Register descriptions with whatever recorder is installed.
pub fn describe() {
    describe_counter!("relay_requests_total", "Proxied requests by method and status.");
    describe_histogram!(
        "relay_request_duration_seconds",
        Unit::Seconds,
        "End-to-end request duration in seconds."
    );
    describe_counter!("relay_cache_events_total", "Cache interactions by event.");
    describe_counter!("relay_rate_limited_total", "Requests rejected by admission control.");
    describe_counter!("relay_circuit_transitions_total", "Circuit state transitions by target state.");
    describe_counter!("relay_origin_blocked_total", "Requests refused because of their Origin.");
}

/// Install the global Prometheus recorder.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("relay_request_duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )?
        .install_recorder()?;
    describe();
    Ok(handle)
}

pub fn record_request(method: &str, status: u16, duration: Duration) {
    counter!("relay_requests_total", "method" => method.to_string(), "status" => status.to_string()).increment(1);
    histogram!("relay_request_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_cache_event(event: CacheEvent) {
    counter!("relay_cache_events_total", "event" => event.as_str()).increment(1);
}

pub fn record_rate_limited(reason: &'static str) {
    counter!("relay_rate_limited_total", "reason" => reason).increment(1);
}

pub fn record_circuit_transition(to: &'static str) {
    counter!("relay_circuit_transitions_total", "to" => to).increment(1);
}

pub fn record_origin_blocked() {
    counter!("relay_origin_blocked_total").increment(1);
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetCount {
    pub target: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OriginCount {
    pub origin: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MethodCount {
    pub method: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCount {
    pub status_code: u16,
    pub count: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheEventCounts {
    pub hit: u64,
    pub miss: u64,
    pub bypass: u64,
    pub dedupe: u64,
    pub error: u64,
}

/// JSON body of `/metrics`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub error_rate: f64,
    /// Milliseconds.
    pub avg_response_time: f64,
    pub percentiles: Percentiles,
    pub top_targets: Vec<TargetCount>,
    pub top_origins: Vec<OriginCount>,
    pub method_distribution: Vec<MethodCount>,
    pub status_code_distribution: Vec<StatusCount>,
    pub rate_limit_hits: u64,
    pub origin_blocks: u64,
    pub cache: CacheEventCounts,
    pub uptime_secs: f64,
}

#[derive(Default)]
struct Counters {
    total_requests: u64,
    total_duration_ms: f64,
    errors: u64,
    latencies: Vec<f64>,
    next_sample: usize,
    targets: HashMap<String, u64>,
    origins: HashMap<String, u64>,
    methods: HashMap<String, u64>,
    statuses: HashMap<u16, u64>,
    cache: CacheEventCounts,
    rate_limit_hits: u64,
    origin_blocks: u64,
}

/// Count `key`, keeping the busiest `max` keys once the map grows past
/// 1.25 times that.
fn push_ranked(map: &mut HashMap<String, u64>, key: &str, max: usize) {
    *map.entry(key.to_string()).or_default() += 1;
    if map.len() * 4 <= max * 5 {
        return;
    }
    let mut ranked: Vec<(String, u64)> = map.drain().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked.truncate(max);
    map.extend(ranked);
}

fn top(map: &HashMap<String, u64>, limit: usize) -> Vec<(String, u64)> {
    let mut ranked: Vec<(String, u64)> = map.iter().map(|(k, v)| (k.clone(), *v)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(limit);
    ranked
}

impl Counters {
    fn push_latency(&mut self, ms: f64) {
        if self.latencies.len() < LATENCY_SAMPLES {
            self.latencies.push(ms);
        } else {
            self.latencies[self.next_sample] = ms;
        }
        self.next_sample = (self.next_sample + 1) % LATENCY_SAMPLES;
    }

    fn push_target(&mut self, target: &str) {
        push_ranked(&mut self.targets, target, MAX_TRACKED_TARGETS);
    }

    fn percentiles(&self) -> Percentiles {
        if self.latencies.is_empty() {
            return Percentiles::default();
        }
        let mut sorted = self.latencies.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let at = |p: f64| {
            let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
            sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
        };
        Percentiles {
            p50: at(50.0),
            p95: at(95.0),
            p99: at(99.0),
        }
    }
}

/// Request statistics for one server instance.
pub struct ProxyStats {
    counters: Mutex<Counters>,
    started: Instant,
}

impl Default for ProxyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyStats {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            started: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a finished request. `target` is the proxied URL's origin, if any.
    pub fn record_request(&self, method: &str, status: u16, duration: Duration, target: Option<&str>) {
        record_request(method, status, duration);
        let ms = duration.as_secs_f64() * 1_000.0;
        let mut c = self.lock();
        c.total_requests += 1;
        c.total_duration_ms += ms;
        if status >= 500 {
            c.errors += 1;
        }
        c.push_latency(ms);
        *c.methods.entry(method.to_ascii_uppercase()).or_default() += 1;
        *c.statuses.entry(status).or_default() += 1;
        if let Some(target) = target {
            c.push_target(target);
        }
    }

    pub fn record_cache(&self, event: CacheEvent) {
        record_cache_event(event);
        let mut c = self.lock();
        let slot = match event {
            CacheEvent::Hit => &mut c.cache.hit,
            CacheEvent::Miss => &mut c.cache.miss,
            CacheEvent::Bypass => &mut c.cache.bypass,
            CacheEvent::Dedupe => &mut c.cache.dedupe,
            CacheEvent::Error => &mut c.cache.error,
        };
        *slot += 1;
    }

    pub fn record_rate_limited(&self, reason: &'static str) {
        record_rate_limited(reason);
        self.lock().rate_limit_hits += 1;
    }

    /// Count a request's `Origin` header value.
    pub fn record_origin(&self, origin: &str) {
        push_ranked(&mut self.lock().origins, origin, MAX_TRACKED_ORIGINS);
    }

    pub fn record_origin_blocked(&self) {
        record_origin_blocked();
        self.lock().origin_blocks += 1;
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = self.lock();
        let total = c.total_requests;
        let (error_rate, avg_response_time) = if total == 0 {
            (0.0, 0.0)
        } else {
            (c.errors as f64 / total as f64, c.total_duration_ms / total as f64)
        };

        let top_targets = top(&c.targets, TOP_TARGETS)
            .into_iter()
            .map(|(target, count)| TargetCount { target, count })
            .collect();
        let top_origins = top(&c.origins, TOP_ORIGINS)
            .into_iter()
            .map(|(origin, count)| OriginCount { origin, count })
            .collect();

        let mut method_distribution: Vec<MethodCount> = c
            .methods
            .iter()
            .map(|(method, count)| MethodCount {
                method: method.clone(),
                count: *count,
            })
            .collect();
        method_distribution.sort_by(|a, b| a.method.cmp(&b.method));

        let mut status_code_distribution: Vec<StatusCount> = c
            .statuses
            .iter()
            .map(|(status_code, count)| StatusCount {
                status_code: *status_code,
                count: *count,
            })
            .collect();
        status_code_distribution.sort_by_key(|s| s.status_code);

        StatsSnapshot {
            total_requests: total,
            error_rate,
            avg_response_time,
            percentiles: c.percentiles(),
            top_targets,
            top_origins,
            method_distribution,
            status_code_distribution,
            rate_limit_hits: c.rate_limit_hits,
            origin_blocks: c.origin_blocks,
            cache: c.cache.clone(),
            uptime_secs: self.uptime().as_secs_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_aggregates_requests() {
        let stats = ProxyStats::new();
        stats.record_request("get", 200, Duration::from_millis(10), Some("https://a.test"));
        stats.record_request("GET", 502, Duration::from_millis(30), Some("https://a.test"));
        stats.record_request("POST", 201, Duration::from_millis(20), Some("https://b.test"));
        stats.record_cache(CacheEvent::Hit);
        stats.record_cache(CacheEvent::Miss);
        stats.record_cache(CacheEvent::Miss);
        stats.record_rate_limited("window");

        let snap = stats.snapshot();
        assert_eq!(snap.total_requests, 3);
        assert!((snap.error_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((snap.avg_response_time - 20.0).abs() < 1e-6);
        assert_eq!(snap.top_targets[0].target, "https://a.test");
        assert_eq!(snap.top_targets[0].count, 2);
        assert_eq!(snap.method_distribution[0].method, "GET");
        assert_eq!(snap.method_distribution[0].count, 2);
        assert_eq!(snap.status_code_distribution.len(), 3);
        assert_eq!(snap.cache.miss, 2);
        assert_eq!(snap.rate_limit_hits, 1);
    }

    #[test]
    fn percentiles_use_nearest_rank() {
        let stats = ProxyStats::new();
        for ms in 1..=100 {
            stats.record_request("GET", 200, Duration::from_millis(ms), None);
        }
        let p = stats.snapshot().percentiles;
        assert!((p.p50 - 50.0).abs() < 1e-6);
        assert!((p.p95 - 95.0).abs() < 1e-6);
        assert!((p.p99 - 99.0).abs() < 1e-6);
    }

    #[test]
    fn latency_ring_is_bounded() {
        let mut counters = Counters::default();
        for i in 0..(LATENCY_SAMPLES + 10) {
            counters.push_latency(i as f64);
        }
        assert_eq!(counters.latencies.len(), LATENCY_SAMPLES);
        assert_eq!(counters.latencies[0], LATENCY_SAMPLES as f64);
    }

    #[test]
    fn target_map_is_pruned_to_bound() {
        let mut counters = Counters::default();
        for _ in 0..3 {
            counters.push_target("https://hot.test");
        }
        for i in 0..(MAX_TRACKED_TARGETS * 2) {
            counters.push_target(&format!("https://t{i}.test"));
        }
        assert!(counters.targets.len() <= MAX_TRACKED_TARGETS * 5 / 4);
        assert_eq!(counters.targets.get("https://hot.test"), Some(&3));
    }

    #[test]
    fn origins_are_ranked() {
        let stats = ProxyStats::new();
        for _ in 0..3 {
            stats.record_origin("https://app.test");
        }
        stats.record_origin("unknown");
        stats.record_origin_blocked();

        let snap = stats.snapshot();
        assert_eq!(snap.top_origins[0].origin, "https://app.test");
        assert_eq!(snap.top_origins[0].count, 3);
        assert_eq!(snap.top_origins.len(), 2);
        assert_eq!(snap.origin_blocks, 1);
    }

    #[test]
    fn facade_events_reach_prometheus() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            describe();
            record_request("GET", 200, Duration::from_millis(12));
            record_cache_event(CacheEvent::Hit);
            record_rate_limited("daily");
            record_circuit_transition("OPEN");
        });

        let text = handle.render();
        assert!(text.contains("relay_requests_total{method=\"GET\",status=\"200\"} 1"));
        assert!(text.contains("relay_cache_events_total{event=\"hit\"} 1"));
        assert!(text.contains("relay_rate_limited_total{reason=\"daily\"} 1"));
        assert!(text.contains("relay_circuit_transitions_total{to=\"OPEN\"} 1"));
    }
}
