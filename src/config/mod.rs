//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → each service built from its own section
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → sent to the server over an mpsc channel
//!     → admission policy swapped atomically (ArcSwap)
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Only admission settings reload live; the rest needs a restart

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use schema::{
    AbuseConfig, AdminConfig, CacheBackendKind, CacheConfig, CircuitBreakerConfig, CorsConfig,
    DedupeConfig, ForwardConfig, ListenerConfig, LogFormat, ObservabilityConfig, OriginConfig,
    ProxyConfig, RateLimitConfig, SharedStoreConfig, TargetConfig, TimeoutConfig,
};
