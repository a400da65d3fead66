//! Service info, health, metrics and circuit diagnostics.

use std::sync::atomic::Ordering;

use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

use crate::http::server::AppState;
use crate::observability::metrics::StatsSnapshot;
use crate::resilience::{CircuitSnapshot, CircuitState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub usage: &'static str,
    pub started_at: String,
    pub endpoints: Vec<&'static str>,
}

pub fn service_info(state: &AppState) -> ServiceInfo {
    ServiceInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        usage: "/?url=<absolute http(s) URL>[&refresh=true]",
        started_at: state.started_at.to_rfc3339(),
        endpoints: vec![
            "/health",
            "/health/live",
            "/health/ready",
            "/metrics",
            "/metrics/prometheus",
            "/circuit-breakers",
        ],
    }
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptimeSecs": state.dispatcher.stats().uptime().as_secs(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

pub async fn live() -> Json<serde_json::Value> {
    Json(json!({ "status": "alive" }))
}

/// Ready unless the server is draining. Includes cache stats.
pub async fn ready(State(state): State<AppState>) -> Response {
    let draining = state.draining.load(Ordering::SeqCst);
    let cache = state.dispatcher.cache().stats().await;
    let body = Json(json!({
        "status": if draining { "draining" } else { "ready" },
        "cache": cache,
        "inFlight": state.dispatcher.coalescer().in_flight(),
        "distributedDedupe": state.dispatcher.coalescer().is_distributed(),
    }));
    let status = if draining {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, body).into_response()
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSummary {
    pub total: usize,
    pub open: usize,
    pub half_open: usize,
}

pub fn circuit_summary(circuits: &[CircuitSnapshot]) -> CircuitSummary {
    CircuitSummary {
        total: circuits.len(),
        open: circuits.iter().filter(|c| c.state == CircuitState::Open).count(),
        half_open: circuits.iter().filter(|c| c.state == CircuitState::HalfOpen).count(),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    #[serde(flatten)]
    pub stats: StatsSnapshot,
    pub circuits: CircuitSummary,
    pub in_flight: usize,
}

pub async fn metrics_json(State(state): State<AppState>) -> Json<MetricsReport> {
    let circuits = state.dispatcher.circuits().snapshot();
    Json(MetricsReport {
        stats: state.dispatcher.stats().snapshot(),
        circuits: circuit_summary(&circuits),
        in_flight: state.dispatcher.coalescer().in_flight(),
    })
}

pub async fn metrics_prometheus(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": true, "message": "Prometheus recorder not installed" })),
        )
            .into_response(),
    }
}

pub async fn circuit_breakers(State(state): State<AppState>) -> Json<serde_json::Value> {
    let circuits = state.dispatcher.circuits().snapshot();
    Json(json!({
        "summary": circuit_summary(&circuits),
        "circuits": circuits,
    }))
}
