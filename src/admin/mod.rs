//! Admin API, mounted under `/admin` when enabled and guarded by a bearer
//! token.

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::http::server::AppState;

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/cache", get(get_cache))
        .route("/admin/cache/clear", post(clear_cache))
        .route("/admin/circuits", get(get_circuits))
        .route("/admin/circuits/reset", post(reset_circuits))
        .route_layer(middleware::from_fn_with_state(state, admin_auth_middleware))
}
