use std::sync::atomic::Ordering;

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::cache::CacheStats;
use crate::http::diagnostics::{circuit_summary, CircuitSummary};
use crate::http::server::AppState;
use crate::resilience::CircuitSnapshot;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub started_at: String,
    pub uptime_secs: u64,
    pub total_requests: u64,
    pub in_flight: usize,
    pub distributed_dedupe: bool,
    pub circuits: CircuitSummary,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let stats = state.dispatcher.stats();
    let circuits = state.dispatcher.circuits().snapshot();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: if state.draining.load(Ordering::SeqCst) {
            "draining"
        } else {
            "operational"
        },
        started_at: state.started_at.to_rfc3339(),
        uptime_secs: stats.uptime().as_secs(),
        total_requests: stats.snapshot().total_requests,
        in_flight: state.dispatcher.coalescer().in_flight(),
        distributed_dedupe: state.dispatcher.coalescer().is_distributed(),
        circuits: circuit_summary(&circuits),
    })
}

pub async fn get_cache(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.dispatcher.cache().stats().await)
}

pub async fn clear_cache(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.dispatcher.cache().clear().await;
    tracing::info!("Cache cleared by admin");
    Json(serde_json::json!({ "cleared": true }))
}

pub async fn get_circuits(State(state): State<AppState>) -> Json<Vec<CircuitSnapshot>> {
    Json(state.dispatcher.circuits().snapshot())
}

#[derive(Debug, Deserialize)]
pub struct ResetQuery {
    pub origin: Option<String>,
}

#[derive(Serialize)]
pub struct ResetResult {
    pub reset: usize,
}

/// Reset one origin's circuit, or every circuit without `origin`.
pub async fn reset_circuits(
    State(state): State<AppState>,
    Query(query): Query<ResetQuery>,
) -> Json<ResetResult> {
    let circuits = state.dispatcher.circuits();
    let reset = match query.origin {
        Some(origin) => {
            let origin = url::Url::parse(&origin)
                .map(|u| u.origin().ascii_serialization())
                .unwrap_or(origin);
            usize::from(circuits.reset(&origin))
        }
        None => circuits.reset_all(),
    };
    tracing::info!(reset, "Circuits reset by admin");
    Json(ResetResult { reset })
}
