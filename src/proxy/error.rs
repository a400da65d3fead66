//! Error taxonomy for the dispatch pipeline.
//!
//! Every failure a caller can observe is one of these variants. Raw client
//! and I/O errors are mapped at the forwarding boundary and never leak.
//! The type is `Clone` so a leader's failure can be handed to every
//! coalesced follower.

use axum::{
    body::Body,
    http::{header, HeaderValue, StatusCode},
    response::Response,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyError {
    #[error("Missing required query parameter 'url'")]
    MissingTarget,

    #[error("Invalid target URL: {0}")]
    InvalidTarget(String),

    #[error("Target URL exceeds {max} characters")]
    TargetTooLong { max: usize },

    #[error("Method {method} is not allowed")]
    MethodNotAllowed { method: String, allowed: String },

    #[error("Request body exceeds {limit} bytes")]
    RequestTooLarge { limit: usize },

    #[error("Upstream response exceeds {limit} bytes")]
    ResponseTooLarge { limit: usize },

    #[error("Target host not reachable")]
    UpstreamUnreachable(String),

    #[error("Target did not respond in time")]
    UpstreamTimeout(String),

    #[error("Request aborted before the upstream response completed")]
    Aborted,

    #[error("Target exceeded redirect limit of {0}")]
    RedirectLimit(usize),

    #[error("Circuit open for {origin}")]
    CircuitOpen { origin: String },

    #[error("{0}")]
    DedupeTimeout(String),

    #[error("{message}")]
    RateLimited { message: String, retry_after_secs: u64 },

    #[error("Origin is not allowed to use this proxy")]
    OriginBlocked { origin: String },

    #[error("{0}")]
    Internal(String),
}

/// JSON body returned for every error.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody<'a> {
    pub error: bool,
    pub message: String,
    pub kind: &'static str,
    pub status_code: u16,
    pub request_id: &'a str,
    pub timestamp: String,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MissingTarget | ProxyError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
            ProxyError::TargetTooLong { .. } => StatusCode::URI_TOO_LONG,
            ProxyError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::RequestTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::ResponseTooLarge { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout(_) | ProxyError::Aborted => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::RedirectLimit(_) => StatusCode::BAD_GATEWAY,
            ProxyError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::DedupeTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::OriginBlocked { .. } => StatusCode::FORBIDDEN,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable category.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::MissingTarget
            | ProxyError::InvalidTarget(_)
            | ProxyError::TargetTooLong { .. }
            | ProxyError::MethodNotAllowed { .. } => "validation",
            ProxyError::RequestTooLarge { .. } | ProxyError::ResponseTooLarge { .. } => {
                "payload_too_large"
            }
            ProxyError::UpstreamUnreachable(_) => "upstream_unreachable",
            ProxyError::UpstreamTimeout(_) | ProxyError::Aborted => "upstream_timeout",
            ProxyError::RedirectLimit(_) => "redirect_limit",
            ProxyError::CircuitOpen { .. } => "circuit_open",
            ProxyError::DedupeTimeout(_) => "dedupe_timeout",
            ProxyError::RateLimited { .. } => "rate_limited",
            ProxyError::OriginBlocked { .. } => "origin_blocked",
            ProxyError::Internal(_) => "internal",
        }
    }

    /// Whether this failure says something about the upstream's health.
    pub fn is_upstream_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::UpstreamUnreachable(_)
                | ProxyError::UpstreamTimeout(_)
                | ProxyError::ResponseTooLarge { .. }
                | ProxyError::RedirectLimit(_)
        )
    }

    fn public_message(&self) -> String {
        match self {
            ProxyError::Internal(_) => "Internal Server Error".to_string(),
            other => other.to_string(),
        }
    }

    /// Render the error as a JSON response tagged with the request id.
    pub fn to_response(&self, request_id: &str) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: true,
            message: self.public_message(),
            kind: self.kind(),
            status_code: status.as_u16(),
            request_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let payload = serde_json::to_vec(&body).unwrap_or_default();

        let mut response = Response::new(Body::from(payload));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        match self {
            ProxyError::MethodNotAllowed { allowed, .. } => {
                if let Ok(value) = HeaderValue::from_str(allowed) {
                    headers.insert(header::ALLOW, value);
                }
            }
            ProxyError::RateLimited { retry_after_secs, .. } => {
                headers.insert(header::RETRY_AFTER, HeaderValue::from(*retry_after_secs));
            }
            _ => {}
        }
        response
    }
}
