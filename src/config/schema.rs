//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the relay.
//! All types derive Serde traits for deserialization from config files, and
//! every section has a default so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};

/// Root configuration for the relay.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, client identity).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Upstream forwarding behaviour.
    pub forward: ForwardConfig,

    /// Response cache settings.
    pub cache: CacheConfig,

    /// Request coalescing settings.
    pub dedupe: DedupeConfig,

    /// Per-origin circuit breaker settings.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Per-client rate limiting.
    pub rate_limit: RateLimitConfig,

    /// Spike detection and temporary blocks.
    pub abuse: AbuseConfig,

    /// Calling-origin tracking and blocklist.
    pub origins: OriginConfig,

    /// Target URL validation.
    pub target: TargetConfig,

    /// CORS headers emitted to callers.
    pub cors: CorsConfig,

    /// Optional shared key-value store (redis).
    pub shared_store: SharedStoreConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin API settings.
    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:3000").
    pub bind_address: String,

    /// Use the first `X-Forwarded-For` hop as the client address.
    pub trust_forwarded_for: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            trust_forwarded_for: false,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Whole-request deadline for the client-facing side.
    pub client_request_ms: u64,

    /// Total deadline for one upstream exchange (connect, headers, body).
    pub upstream_ms: u64,

    /// Upstream connect timeout.
    pub connect_ms: u64,

    /// Slack added to the upstream deadline when bounding coalescing waits.
    pub dedupe_margin_ms: u64,

    /// Idle pooled upstream connections are closed after this long.
    pub pool_idle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            client_request_ms: 30_000,
            upstream_ms: 30_000,
            connect_ms: 5_000,
            dedupe_margin_ms: 1_000,
            pool_idle_secs: 30,
        }
    }
}

/// Upstream forwarding behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ForwardConfig {
    /// Methods accepted for proxying. GET and HEAD are always allowed.
    pub allowed_methods: Vec<String>,

    /// Request headers removed before forwarding.
    pub strip_request_headers: Vec<String>,

    /// Forward the caller's Origin and Referer headers.
    pub pass_through_origin: bool,

    /// Forward bare OPTIONS requests instead of answering 204 locally.
    pub options_passthrough: bool,

    /// Follow upstream redirects.
    pub follow_redirects: bool,

    /// Maximum redirects followed per request.
    pub max_redirects: usize,

    /// Maximum request body forwarded upstream.
    pub max_request_bytes: usize,

    /// Maximum upstream response body relayed to the caller.
    pub max_response_bytes: usize,

    /// Idle keep-alive connections kept per upstream host.
    pub pool_max_idle_per_host: usize,

    /// Explicit proxy for upstream traffic (e.g., "http://proxy:3128").
    pub upstream_proxy: Option<String>,

    /// Honor HTTP_PROXY / HTTPS_PROXY / NO_PROXY from the environment.
    pub use_system_proxy: bool,

    /// Verify upstream TLS certificates.
    pub verify_tls: bool,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            allowed_methods: ["GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            strip_request_headers: [
                "accept-encoding",
                "connection",
                "keep-alive",
                "proxy-authorization",
                "proxy-authenticate",
                "te",
                "trailer",
                "transfer-encoding",
                "upgrade",
                "via",
            ]
            .iter()
            .map(|h| h.to_string())
            .collect(),
            pass_through_origin: false,
            options_passthrough: false,
            follow_redirects: true,
            max_redirects: 5,
            max_request_bytes: 10 * 1024 * 1024,
            max_response_bytes: 10 * 1024 * 1024,
            pool_max_idle_per_host: 32,
            upstream_proxy: None,
            use_system_proxy: true,
            verify_tls: true,
        }
    }
}

/// Where cached responses live.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    /// In-process LRU with compression and snapshots.
    Memory,
    /// Entries kept in the shared store.
    Shared,
}

/// Response cache settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable response caching.
    pub enabled: bool,

    /// Backend holding the entries.
    pub backend: CacheBackendKind,

    /// Entry lifetime.
    pub ttl_secs: u64,

    /// Maximum number of entries (memory backend).
    pub max_entries: usize,

    /// Maximum stored bytes, counted after compression (memory backend).
    pub max_bytes: usize,

    /// Responses with larger bodies are never stored.
    pub max_body_bytes: usize,

    /// Bodies above this size are gzip-compressed.
    pub compress_threshold_bytes: usize,

    /// Snapshot file for the memory backend. Disabled when unset.
    pub snapshot_path: Option<String>,

    /// Interval between snapshot writes.
    pub snapshot_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CacheBackendKind::Memory,
            ttl_secs: 300,
            max_entries: 500,
            max_bytes: 256 * 1024 * 1024,
            max_body_bytes: 10 * 1024 * 1024,
            compress_threshold_bytes: 1024,
            snapshot_path: None,
            snapshot_interval_secs: 300,
        }
    }
}

/// Request coalescing settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DedupeConfig {
    /// Coordinate leaders across instances through the shared store.
    pub distributed: bool,

    /// Lifetime of a distributed in-flight lock.
    pub lock_ttl_ms: u64,

    /// How long a follower waits for the leader's result.
    pub wait_timeout_ms: u64,

    /// Poll interval for remote followers.
    pub poll_interval_ms: u64,

    /// Key prefix for distributed locks.
    pub key_prefix: String,

    /// Interval of the stale in-flight sweep.
    pub sweep_interval_secs: u64,

    /// Local in-flight entries older than this are rejected by the sweep.
    pub local_safety_timeout_ms: u64,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            distributed: true,
            lock_ttl_ms: 15_000,
            wait_timeout_ms: 14_000,
            poll_interval_ms: 75,
            key_prefix: "corsrelay:dedupe:".to_string(),
            sweep_interval_secs: 60,
            local_safety_timeout_ms: 60_000,
        }
    }
}

/// Per-origin circuit breaker settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaking.
    pub enabled: bool,

    /// Failures inside the window that open a closed circuit.
    pub failure_threshold: u32,

    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,

    /// Time an open circuit rejects before allowing trials.
    pub open_timeout_ms: u64,

    /// Sliding window for counting failures.
    pub window_ms: u64,

    /// Maximum number of tracked origins.
    pub max_circuits: usize,

    /// Circuits untouched for this long are evicted.
    pub idle_ttl_secs: u64,

    /// Upstream statuses counted as failures (empty by default).
    pub trip_on_status: Vec<u16>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_ms: 60_000,
            window_ms: 120_000,
            max_circuits: 1_000,
            idle_ttl_secs: 30 * 60,
            trip_on_status: Vec::new(),
        }
    }
}

/// Per-client rate limiting.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable admission control.
    pub enabled: bool,

    /// Sliding window length.
    pub window_ms: u64,

    /// Requests allowed per window.
    pub max_requests: u32,

    /// Requests allowed per 24 hours.
    pub daily_limit: u32,

    /// Exempt clients: exact addresses or CIDR ranges.
    pub whitelist: Vec<String>,

    /// Do not count OPTIONS requests.
    pub skip_options: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 600_000,
            max_requests: 200,
            daily_limit: 200_000,
            whitelist: Vec::new(),
            skip_options: true,
        }
    }
}

/// Spike detection and temporary blocks.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AbuseConfig {
    /// Enable spike detection.
    pub enabled: bool,

    /// Requests inside the spike window that trigger a block.
    pub spike_threshold: u32,

    /// Spike window length.
    pub spike_window_secs: u64,

    /// Block duration.
    pub block_minutes: u64,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            spike_threshold: 200,
            spike_window_secs: 60,
            block_minutes: 15,
        }
    }
}

/// Calling-origin tracking. Origins are compared lowercased; requests
/// without an `Origin` header count as "unknown".
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OriginConfig {
    /// Track calling origins at all.
    pub enabled: bool,

    /// Feed origins into the top-origins ranking on `/metrics`.
    pub track_top: bool,

    /// Keep 24 h per-origin counts and log when they cross the thresholds.
    pub track_usage: bool,

    /// Daily count at which an origin is logged as a warning (once per day).
    pub warn_threshold: u64,

    /// Daily count at which an origin is logged as an error (once per day).
    pub alert_threshold: u64,

    /// Reject origins on `block_list` with 403.
    pub auto_block: bool,

    /// Origins refused when `auto_block` is set.
    pub block_list: Vec<String>,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            track_top: true,
            track_usage: true,
            warn_threshold: 10_000,
            alert_threshold: 50_000,
            auto_block: false,
            block_list: Vec::new(),
        }
    }
}

/// Target URL validation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Longest accepted target URL.
    pub max_url_length: usize,

    /// Accept loopback, private and link-local address literals.
    pub allow_private_networks: bool,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            max_url_length: 4096,
            allow_private_networks: false,
        }
    }
}

/// CORS headers emitted to callers.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Allowed caller origins; "*" allows any.
    pub allowed_origins: Vec<String>,

    /// Preflight cache lifetime.
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            max_age_secs: 86_400,
        }
    }
}

/// Optional shared key-value store.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SharedStoreConfig {
    /// Redis connection URL (e.g., "redis://127.0.0.1:6379/"). Unset disables the store.
    pub url: Option<String>,

    /// Key prefix for shared cache entries.
    pub cache_prefix: String,

    /// Deadline for a single store operation.
    pub operation_timeout_ms: u64,
}

impl Default for SharedStoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            cache_prefix: "corsrelay:cache:".to_string(),
            operation_timeout_ms: 1_000,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Install the Prometheus recorder.
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "cors_relay=info,tower_http=info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
        }
    }
}

/// Admin API settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Mount the admin routes under `/admin`.
    pub enabled: bool,

    /// Bearer token required by the admin routes.
    pub api_key: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: "change-me".to_string(),
        }
    }
}
