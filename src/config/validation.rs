//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, limits > 0)
//! - Check cross-section requirements (shared cache needs a store)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use axum::http::Method;
use thiserror::Error;

use crate::config::schema::{CacheBackendKind, ProxyConfig};
use crate::security::whitelist::Whitelist;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("invalid bind address '{0}'")]
    BindAddress(String),

    #[error("unknown HTTP method '{0}' in forward.allowed_methods")]
    Method(String),

    #[error("invalid rate_limit.whitelist entry: {0}")]
    Whitelist(String),

    #[error("origins.alert_threshold must not be below origins.warn_threshold")]
    OriginThresholds,

    #[error("cache.backend = \"shared\" requires shared_store.url")]
    SharedCacheWithoutStore,

    #[error("admin.api_key must be set when the admin API is enabled")]
    AdminKey,
}

/// Validate a configuration, reporting every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(config.listener.bind_address.clone()));
    }

    let positive: [(&'static str, u64); 17] = [
        ("timeouts.client_request_ms", config.timeouts.client_request_ms),
        ("timeouts.upstream_ms", config.timeouts.upstream_ms),
        ("timeouts.connect_ms", config.timeouts.connect_ms),
        ("forward.max_request_bytes", config.forward.max_request_bytes as u64),
        ("forward.max_response_bytes", config.forward.max_response_bytes as u64),
        ("cache.ttl_secs", config.cache.ttl_secs),
        ("cache.max_entries", config.cache.max_entries as u64),
        ("cache.max_bytes", config.cache.max_bytes as u64),
        ("dedupe.lock_ttl_ms", config.dedupe.lock_ttl_ms),
        ("dedupe.wait_timeout_ms", config.dedupe.wait_timeout_ms),
        ("dedupe.poll_interval_ms", config.dedupe.poll_interval_ms),
        ("circuit_breaker.failure_threshold", config.circuit_breaker.failure_threshold as u64),
        ("circuit_breaker.success_threshold", config.circuit_breaker.success_threshold as u64),
        ("circuit_breaker.window_ms", config.circuit_breaker.window_ms),
        ("circuit_breaker.max_circuits", config.circuit_breaker.max_circuits as u64),
        ("rate_limit.window_ms", config.rate_limit.window_ms),
        ("target.max_url_length", config.target.max_url_length as u64),
    ];
    for (field, value) in positive {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    }

    if config.rate_limit.enabled {
        if config.rate_limit.max_requests == 0 {
            errors.push(ValidationError::Zero { field: "rate_limit.max_requests" });
        }
        if config.rate_limit.daily_limit == 0 {
            errors.push(ValidationError::Zero { field: "rate_limit.daily_limit" });
        }
    }

    if config.abuse.enabled && config.abuse.spike_threshold == 0 {
        errors.push(ValidationError::Zero { field: "abuse.spike_threshold" });
    }

    if config.origins.track_usage && config.origins.alert_threshold < config.origins.warn_threshold {
        errors.push(ValidationError::OriginThresholds);
    }

    for method in &config.forward.allowed_methods {
        if Method::from_bytes(method.to_ascii_uppercase().as_bytes()).is_err() {
            errors.push(ValidationError::Method(method.clone()));
        }
    }

    if let Err(e) = Whitelist::parse(&config.rate_limit.whitelist) {
        errors.push(ValidationError::Whitelist(e.to_string()));
    }

    if config.cache.backend == CacheBackendKind::Shared && config.shared_store.url.is_none() {
        errors.push(ValidationError::SharedCacheWithoutStore);
    }

    if config.admin.enabled {
        let key = config.admin.api_key.trim();
        if key.is_empty() || key == "change-me" {
            errors.push(ValidationError::AdminKey);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
