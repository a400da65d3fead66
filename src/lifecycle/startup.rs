//! Startup orchestration.
//!
//! Builds every service from one validated configuration, leaves first:
//! shared store, cache, coalescer, circuits, stats, admission, forwarder,
//! dispatcher. Any failure here is fatal.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use thiserror::Error;

use crate::cache::{LocalCache, ResponseCache};
use crate::coalesce::Coalescer;
use crate::config::validation::validate_config;
use crate::config::ProxyConfig;
use crate::http::server::AppState;
use crate::observability::metrics::ProxyStats;
use crate::proxy::{Dispatcher, Forwarder};
use crate::resilience::{CircuitRegistry, TimeoutBudget};
use crate::security::{AdmissionControl, AdmissionPolicy};
use crate::store::{self, SharedStore, StoreError};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("shared store: {0}")]
    Store(#[from] StoreError),

    #[error("upstream client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Everything the server needs to run.
pub struct Services {
    pub state: AppState,
    /// The in-process cache, when that backend is active. The snapshot task
    /// writes it out.
    pub local_cache: Option<Arc<LocalCache>>,
}

/// Build services, connecting to the configured shared store.
pub fn build_services(config: ProxyConfig, prometheus: Option<PrometheusHandle>) -> Result<Services, StartupError> {
    let store = store::from_config(&config.shared_store)?;
    build_services_with_store(config, store, prometheus)
}

/// Build services around an already constructed store.
pub fn build_services_with_store(
    config: ProxyConfig,
    store: Option<Arc<dyn SharedStore>>,
    prometheus: Option<PrometheusHandle>,
) -> Result<Services, StartupError> {
    validate_config(&config).map_err(|errors| {
        StartupError::Config(
            errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        )
    })?;

    let budget = TimeoutBudget::from_config(&config);
    let (cache, local_cache) =
        ResponseCache::from_config(&config.cache, store.clone(), &config.shared_store.cache_prefix);
    let coalescer = Coalescer::new(&config, &budget, store.clone());
    let circuits = CircuitRegistry::new(&config.circuit_breaker);
    let stats = Arc::new(ProxyStats::new());
    let admission = AdmissionControl::new(AdmissionPolicy::from_config(&config), stats.clone());
    let forwarder = Forwarder::new(&config, &budget)?;

    tracing::info!(
        cache_enabled = config.cache.enabled,
        cache_backend = ?config.cache.backend,
        distributed_dedupe = coalescer.is_distributed(),
        shared_store = store.is_some(),
        circuit_breaker = config.circuit_breaker.enabled,
        rate_limit = config.rate_limit.enabled,
        upstream_timeout_ms = budget.upstream.as_millis() as u64,
        dedupe_wait_ms = budget.dedupe_wait.as_millis() as u64,
        "Services initialized"
    );

    let dispatcher = Dispatcher::new(
        &config,
        forwarder,
        Arc::new(cache),
        Arc::new(coalescer),
        Arc::new(circuits),
        stats,
    );

    Ok(Services {
        state: AppState::new(config, Arc::new(dispatcher), Arc::new(admission), prometheus),
        local_cache,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_is_fatal() {
        let mut config = ProxyConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        match build_services_with_store(config, None, None) {
            Err(StartupError::Config(message)) => assert!(message.contains("failure_threshold")),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn memory_backend_exposes_local_cache() {
        let services = build_services_with_store(ProxyConfig::default(), None, None).unwrap();
        assert!(services.local_cache.is_some());
        assert!(!services.state.dispatcher.coalescer().is_distributed());
    }

    #[test]
    fn shared_store_enables_distributed_coalescing() {
        let mut config = ProxyConfig::default();
        config.shared_store.url = Some("redis://127.0.0.1:6379/".into());
        config.cache.backend = crate::config::CacheBackendKind::Shared;
        let store: Arc<dyn SharedStore> = Arc::new(store::MemoryStore::new());

        let services = build_services_with_store(config, Some(store), None).unwrap();
        assert!(services.local_cache.is_none());
        assert!(services.state.dispatcher.coalescer().is_distributed());
    }

    #[test]
    fn shared_store_with_memory_cache_coalesces_locally() {
        let mut config = ProxyConfig::default();
        config.shared_store.url = Some("redis://127.0.0.1:6379/".into());
        let store: Arc<dyn SharedStore> = Arc::new(store::MemoryStore::new());

        let services = build_services_with_store(config, Some(store), None).unwrap();
        assert!(services.local_cache.is_some());
        assert!(!services.state.dispatcher.coalescer().is_distributed());
    }
}
