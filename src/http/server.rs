//! HTTP server setup.
//!
//! # Responsibilities
//! - Build the axum router: proxy route, diagnostics, admin
//! - Wire up middleware (request id, tracing, CORS, timeout, admission)
//! - Serve with connection info and graceful shutdown
//! - Run background tasks and apply config reloads

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::admin;
use crate::cache::snapshot::SnapshotTask;
use crate::cache::LocalCache;
use crate::config::{CorsConfig, ProxyConfig};
use crate::http::diagnostics;
use crate::http::request::{request_id, ProxyQuery};
use crate::lifecycle::{Services, Shutdown};
use crate::proxy::dispatch::{X_PROXY_BYPASS_REASON, X_PROXY_CACHE, X_PROXY_STATUS, X_PROXY_TIMING, X_CIRCUIT_BREAKER};
use crate::proxy::headers::X_REQUEST_ID;
use crate::proxy::{Dispatcher, ProxyRequest};
use crate::security::{admission_middleware, client_ip, AdmissionControl, AdmissionPolicy};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Current configuration; replaced on reload.
    pub config: Arc<ArcSwap<ProxyConfig>>,
    pub dispatcher: Arc<Dispatcher>,
    pub admission: Arc<AdmissionControl>,
    pub prometheus: Option<PrometheusHandle>,
    /// Set once shutdown starts.
    pub draining: Arc<AtomicBool>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        config: ProxyConfig,
        dispatcher: Arc<Dispatcher>,
        admission: Arc<AdmissionControl>,
        prometheus: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            dispatcher,
            admission,
            prometheus,
            draining: Arc::new(AtomicBool::new(false)),
            started_at: Utc::now(),
        }
    }
}

/// HTTP server for the relay.
pub struct HttpServer {
    state: AppState,
    local_cache: Option<Arc<LocalCache>>,
    router: Router,
}

impl HttpServer {
    pub fn new(services: Services) -> Self {
        let config = services.state.config.load_full();
        let router = build_router(&config, services.state.clone());
        Self {
            state: services.state,
            local_cache: services.local_cache,
            router,
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until `shutdown` fires, then drain and stop background tasks.
    pub async fn run(
        self,
        listener: TcpListener,
        config_updates: mpsc::UnboundedReceiver<ProxyConfig>,
        shutdown: Shutdown,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        let config = self.state.config.load_full();
        tracing::info!(address = %addr, "HTTP server starting");

        let mut background = vec![
            tokio::spawn(self.state.admission.clone().run_sweeper(shutdown.subscribe())),
            self.state.dispatcher.coalescer().spawn_sweeper(shutdown.subscribe()),
            tokio::spawn(apply_reloads(self.state.clone(), config_updates, shutdown.clone())),
        ];
        if let (Some(cache), Some(path)) = (&self.local_cache, &config.cache.snapshot_path) {
            let task = SnapshotTask::new(
                cache.clone(),
                PathBuf::from(path),
                Duration::from_secs(config.cache.snapshot_interval_secs),
            );
            background.push(tokio::spawn(task.run(shutdown.subscribe())));
        }

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        let draining = self.state.draining.clone();
        let mut stop = shutdown.subscribe();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop.recv().await;
                draining.store(true, Ordering::SeqCst);
                tracing::info!("Draining in-flight requests");
            })
            .await?;

        shutdown.trigger();
        for task in background {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Build the router with all middleware layers.
pub fn build_router(config: &ProxyConfig, state: AppState) -> Router {
    let proxy = Router::new()
        .route("/", any(proxy_handler))
        .route_layer(middleware::from_fn_with_state(
            state.admission.clone(),
            admission_middleware,
        ));

    let diagnostics = Router::new()
        .route("/health", get(diagnostics::health))
        .route("/health/live", get(diagnostics::live))
        .route("/health/ready", get(diagnostics::ready))
        .route("/metrics", get(diagnostics::metrics_json))
        .route("/metrics/prometheus", get(diagnostics::metrics_prometheus))
        .route("/circuit-breakers", get(diagnostics::circuit_breakers));

    let mut app = proxy.merge(diagnostics);
    if config.admin.enabled {
        app = app.merge(admin::router(state.clone()));
    }

    app.fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), reject_when_draining))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(X_REQUEST_ID, MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(X_REQUEST_ID))
                .layer(cors_layer(&config.cors))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::GATEWAY_TIMEOUT,
                    Duration::from_millis(config.timeouts.client_request_ms),
                )),
        )
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let origins = if config.allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            config
                .allowed_origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok()),
        )
    };
    let exposed: [HeaderName; 6] = [
        X_PROXY_CACHE,
        X_PROXY_STATUS,
        X_PROXY_BYPASS_REASON,
        X_PROXY_TIMING,
        X_CIRCUIT_BREAKER,
        X_REQUEST_ID,
    ];
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(exposed)
        .max_age(Duration::from_secs(config.max_age_secs))
}

/// `GET /` without a target answers with service info; everything else is
/// proxied.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let query = ProxyQuery::parse(request.uri().query());
    if query.target.is_none() && request.method() == Method::GET {
        return Json(diagnostics::service_info(&state)).into_response();
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
        .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
    let trust_forwarded_for = state.admission.policy().trust_forwarded_for;
    let client_ip = client_ip::resolve(peer, request.headers(), trust_forwarded_for);
    let request_id = request_id(request.headers());

    let (parts, body) = request.into_parts();
    state
        .dispatcher
        .dispatch(ProxyRequest {
            method: parts.method,
            target: query.target,
            refresh: query.refresh,
            headers: parts.headers,
            body,
            request_id,
            client_ip: Some(client_ip),
        })
        .await
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PlainError {
    error: bool,
    message: &'static str,
    status_code: u16,
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(PlainError {
            error: true,
            message: "Not found",
            status_code: 404,
        }),
    )
        .into_response()
}

async fn reject_when_draining(State(state): State<AppState>, request: Request<Body>, next: Next) -> Response {
    if !state.draining.load(Ordering::SeqCst) {
        return next.run(request).await;
    }
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::CONNECTION, HeaderValue::from_static("close"))],
        Json(PlainError {
            error: true,
            message: "Server is shutting down",
            status_code: 503,
        }),
    )
        .into_response()
}

/// Apply reloaded configs until shutdown. Only the admission policy changes
/// live; other changed sections are reported as needing a restart.
async fn apply_reloads(state: AppState, mut updates: mpsc::UnboundedReceiver<ProxyConfig>, shutdown: Shutdown) {
    let mut stop = shutdown.subscribe();
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Some(config) => apply_reload(&state, config),
                None => break,
            },
            _ = stop.recv() => break,
        }
    }
}

pub(crate) fn apply_reload(state: &AppState, config: ProxyConfig) {
    let current = state.config.load_full();
    let restart_needed = restart_sections(&current, &config);
    if !restart_needed.is_empty() {
        tracing::warn!(sections = ?restart_needed, "Changed sections take effect after a restart");
    }
    state.admission.update_policy(AdmissionPolicy::from_config(&config));
    state.config.store(Arc::new(config));
}

fn restart_sections(old: &ProxyConfig, new: &ProxyConfig) -> Vec<&'static str> {
    fn differs<T: Serialize>(a: &T, b: &T) -> bool {
        serde_json::to_value(a).ok() != serde_json::to_value(b).ok()
    }

    let mut sections = Vec::new();
    if old.listener.bind_address != new.listener.bind_address {
        sections.push("listener.bind_address");
    }
    let checks = [
        ("timeouts", differs(&old.timeouts, &new.timeouts)),
        ("forward", differs(&old.forward, &new.forward)),
        ("cache", differs(&old.cache, &new.cache)),
        ("dedupe", differs(&old.dedupe, &new.dedupe)),
        ("circuit_breaker", differs(&old.circuit_breaker, &new.circuit_breaker)),
        ("target", differs(&old.target, &new.target)),
        ("cors", differs(&old.cors, &new.cors)),
        ("shared_store", differs(&old.shared_store, &new.shared_store)),
        ("observability", differs(&old.observability, &new.observability)),
        ("admin", differs(&old.admin, &new.admin)),
    ];
    sections.extend(checks.into_iter().filter(|(_, changed)| *changed).map(|(name, _)| name));
    sections
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::startup::build_services_with_store;

    #[test]
    fn reload_swaps_admission_and_reports_restart_sections() {
        let services = build_services_with_store(ProxyConfig::default(), None, None).unwrap();
        let state = services.state;

        let mut next = ProxyConfig::default();
        next.rate_limit.max_requests = 7;
        next.cache.ttl_secs = 10;
        assert_eq!(restart_sections(&state.config.load(), &next), vec!["cache"]);

        apply_reload(&state, next);
        assert_eq!(state.admission.policy().rate.max_requests, 7);
        assert_eq!(state.config.load().cache.ttl_secs, 10);
    }

    #[test]
    fn admission_only_changes_need_no_restart() {
        let old = ProxyConfig::default();
        let mut new = ProxyConfig::default();
        new.rate_limit.whitelist = vec!["10.0.0.0/8".into()];
        new.abuse.block_minutes = 1;
        new.listener.trust_forwarded_for = true;
        assert!(restart_sections(&old, &new).is_empty());
    }
}
