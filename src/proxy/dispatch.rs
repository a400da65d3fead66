//! The dispatch pipeline for one proxied request.
//!
//! ```text
//! method check → OPTIONS short-circuit → target validation → circuit check
//!     → cache eligible?
//!         yes → cache read → coalesce (leader / follower)
//!               leader runs detached: fleet lock or remote result, forward,
//!               store, then finish the flight
//!         no  → forward and stream the body straight through
//! ```

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::Response;

use crate::cache::entry::{is_storable, request_decision};
use crate::cache::{BypassReason, CacheDecision, CacheKey, CachedResponse, ResponseCache};
use crate::coalesce::{Coalescer, Coordination, Enrollment, Leadership, Outcome};
use crate::config::{ForwardConfig, ProxyConfig, TargetConfig};
use crate::observability::metrics::{CacheEvent, ProxyStats};
use crate::proxy::error::ProxyError;
use crate::proxy::forward::{has_body, Forwarder};
use crate::proxy::headers::{filter_response_headers, prepare_upstream_headers, X_REQUEST_ID};
use crate::resilience::CircuitRegistry;
use crate::security::target::{self, Target};

pub const X_PROXY_CACHE: HeaderName = HeaderName::from_static("x-proxy-cache");
pub const X_PROXY_STATUS: HeaderName = HeaderName::from_static("x-proxy-status");
pub const X_PROXY_BYPASS_REASON: HeaderName = HeaderName::from_static("x-proxy-bypass-reason");
pub const X_PROXY_TIMING: HeaderName = HeaderName::from_static("x-proxy-timing");
pub const X_CIRCUIT_BREAKER: HeaderName = HeaderName::from_static("x-circuit-breaker");

/// A client request as seen by the pipeline.
pub struct ProxyRequest {
    pub method: Method,
    /// Raw `url` query parameter.
    pub target: Option<String>,
    /// `refresh=true` on the proxy URL.
    pub refresh: bool,
    pub headers: HeaderMap,
    pub body: Body,
    pub request_id: String,
    pub client_ip: Option<IpAddr>,
}

pub struct Dispatcher {
    allowed_methods: Vec<Method>,
    allow_header: String,
    options_passthrough: bool,
    target: TargetConfig,
    forward: ForwardConfig,
    forwarder: Forwarder,
    cache: Arc<ResponseCache>,
    coalescer: Arc<Coalescer>,
    circuits: Arc<CircuitRegistry>,
    stats: Arc<ProxyStats>,
}

impl Dispatcher {
    pub fn new(
        config: &ProxyConfig,
        forwarder: Forwarder,
        cache: Arc<ResponseCache>,
        coalescer: Arc<Coalescer>,
        circuits: Arc<CircuitRegistry>,
        stats: Arc<ProxyStats>,
    ) -> Self {
        let allowed_methods = allowed_methods(&config.forward.allowed_methods);
        let allow_header = allowed_methods
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            allowed_methods,
            allow_header,
            options_passthrough: config.forward.options_passthrough,
            target: config.target.clone(),
            forward: config.forward.clone(),
            forwarder,
            cache,
            coalescer,
            circuits,
            stats,
        }
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn coalescer(&self) -> &Arc<Coalescer> {
        &self.coalescer
    }

    pub fn circuits(&self) -> &Arc<CircuitRegistry> {
        &self.circuits
    }

    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.stats
    }

    /// Run the pipeline. Failures come back as rendered error responses.
    pub async fn dispatch(self: &Arc<Self>, request: ProxyRequest) -> Response {
        let started = Instant::now();
        let method = request.method.clone();
        let request_id = request.request_id.clone();

        let (mut response, origin) = self.route(request).await;

        let elapsed = started.elapsed();
        let headers = response.headers_mut();
        if let Ok(timing) = HeaderValue::from_str(&format!("total={}ms", elapsed.as_millis())) {
            headers.insert(X_PROXY_TIMING, timing);
        }
        if let Ok(id) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, id);
        }

        let status = response.status().as_u16();
        self.stats
            .record_request(method.as_str(), status, elapsed, origin.as_deref());
        tracing::debug!(
            request_id = %request_id,
            method = %method,
            target = origin.as_deref().unwrap_or("-"),
            status,
            elapsed_ms = elapsed.as_millis() as u64,
            "Proxied request finished"
        );
        response
    }

    async fn route(self: &Arc<Self>, request: ProxyRequest) -> (Response, Option<String>) {
        if !self.allowed_methods.contains(&request.method) {
            let error = ProxyError::MethodNotAllowed {
                method: request.method.to_string(),
                allowed: self.allow_header.clone(),
            };
            return (error.to_response(&request.request_id), None);
        }

        if request.method == Method::OPTIONS && !self.options_passthrough {
            return (preflight_response(), None);
        }

        let target = match target::validate(request.target.as_deref(), &self.target) {
            Ok(target) => target,
            Err(error) => {
                tracing::debug!(request_id = %request.request_id, error = %error, "Target rejected");
                return (error.to_response(&request.request_id), None);
            }
        };
        let origin = target.origin.clone();

        if !self.circuits.can_attempt(&target.origin) {
            tracing::warn!(origin = %target.origin, "Circuit open, rejecting request");
            let mut response = ProxyError::CircuitOpen {
                origin: target.origin.clone(),
            }
            .to_response(&request.request_id);
            let headers = response.headers_mut();
            headers.insert(X_CIRCUIT_BREAKER, HeaderValue::from_static("OPEN"));
            headers.insert(X_PROXY_STATUS, HeaderValue::from_static("CIRCUIT_OPEN"));
            return (response, Some(origin));
        }

        let decision = if self.cache.is_enabled() {
            request_decision(&request.method, &request.headers, request.refresh)
        } else {
            CacheDecision::Bypass(BypassReason::Disabled)
        };

        let response = match decision {
            CacheDecision::Eligible => self.cached(request, target).await,
            CacheDecision::Bypass(reason) => {
                self.stats.record_cache(CacheEvent::Bypass);
                self.passthrough(request, target, reason).await
            }
        };
        (response, Some(origin))
    }

    async fn cached(self: &Arc<Self>, request: ProxyRequest, target: Target) -> Response {
        let accept = request.headers.get(header::ACCEPT).and_then(|v| v.to_str().ok());
        let key = CacheKey::new(&request.method, target.as_str(), accept);

        if let Some(hit) = self.cache.get(&key).await {
            self.stats.record_cache(CacheEvent::Hit);
            return replay(&hit, "HIT", "HIT");
        }

        match self.coalescer.enroll(&key) {
            Enrollment::Follower(handle) => {
                self.stats.record_cache(CacheEvent::Dedupe);
                tracing::debug!(cache_key = %key, "Following in-flight request");
                match handle.wait(Some(self.coalescer.wait_timeout())).await {
                    Ok(found) => replay(&found, "HIT", "DEDUPE_FOLLOWER"),
                    Err(error) => tagged_error(&error, &request.request_id, "MISS", "DEDUPE_FOLLOWER"),
                }
            }
            Enrollment::Leader(leadership) => {
                let own = leadership.subscribe();
                let remote = Arc::new(AtomicBool::new(false));
                let headers =
                    prepare_upstream_headers(&request.headers, &self.forward, &request.request_id, request.client_ip);
                self.spawn_leader(leadership, request.method, target, headers, remote.clone());
                let outcome = own.wait(None).await;
                if remote.load(Ordering::Acquire) {
                    self.stats.record_cache(CacheEvent::Hit);
                    return match outcome {
                        Ok(found) => replay(&found, "HIT", "HIT"),
                        Err(error) => tagged_error(&error, &request.request_id, "MISS", "DEDUPE_FOLLOWER"),
                    };
                }
                self.stats.record_cache(CacheEvent::Miss);
                match outcome {
                    Ok(found) => replay(&found, "MISS", "MISS"),
                    Err(error @ ProxyError::DedupeTimeout(_)) => {
                        tagged_error(&error, &request.request_id, "MISS", "DEDUPE_FOLLOWER")
                    }
                    Err(error) => tagged_error(&error, &request.request_id, "MISS", "MISS"),
                }
            }
        }
    }

    /// The leader's work runs detached so a departing client does not
    /// cancel it while followers still wait: fleet coordination, then the
    /// forward. It is cancelled once every waiter is gone.
    fn spawn_leader(
        self: &Arc<Self>,
        mut leadership: Leadership,
        method: Method,
        target: Target,
        headers: HeaderMap,
        remote: Arc<AtomicBool>,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let key = leadership.key().clone();
            let gone = leadership.waiters_gone();
            let outcome = tokio::select! {
                outcome = this.lead(&mut leadership, method, &target, headers, &remote) => outcome,
                _ = gone => {
                    tracing::info!(cache_key = %key, "Every waiter left, cancelling upstream fetch");
                    Err(ProxyError::Aborted)
                }
            };
            leadership.finish(outcome).await;
        });
    }

    async fn lead(
        &self,
        leadership: &mut Leadership,
        method: Method,
        target: &Target,
        headers: HeaderMap,
        remote: &AtomicBool,
    ) -> Outcome {
        match leadership.coordinate(&self.cache).await? {
            Coordination::Remote(found) => {
                remote.store(true, Ordering::Release);
                Ok(found)
            }
            Coordination::Fetch => {
                self.fetch_and_store(method, target, headers, leadership.key())
                    .await
            }
        }
    }

    async fn fetch_and_store(&self, method: Method, target: &Target, headers: HeaderMap, key: &CacheKey) -> Outcome {
        let exchange = async {
            let upstream = self.forwarder.send(method, &target.url, headers, None).await?;
            upstream.collect().await
        };

        match exchange.await {
            Ok((status, upstream_headers, body)) => {
                self.record_status(&target.origin, status);
                let response = CachedResponse::from_upstream(status, &upstream_headers, body);
                if is_storable(status, &upstream_headers, response.body.len(), self.cache.max_body_bytes()) {
                    self.cache.store(key, &response).await;
                }
                Ok(Arc::new(response))
            }
            Err(error) => {
                self.record_error(&target.origin, &error);
                Err(error)
            }
        }
    }

    async fn passthrough(&self, request: ProxyRequest, target: Target, reason: BypassReason) -> Response {
        let ProxyRequest {
            method,
            headers: client_headers,
            body,
            request_id,
            client_ip,
            ..
        } = request;

        let headers = prepare_upstream_headers(&client_headers, &self.forward, &request_id, client_ip);
        let body = has_body(&client_headers).then_some(body);

        let upstream = match self.forwarder.send(method, &target.url, headers, body).await {
            Ok(upstream) => upstream,
            Err(error) => {
                self.record_error(&target.origin, &error);
                return bypass_tagged(error.to_response(&request_id), reason);
            }
        };

        let status = upstream.status;
        let relay_headers = filter_response_headers(&upstream.headers);
        let circuits = Arc::clone(&self.circuits);
        let origin = target.origin.clone();
        let trips = circuits.trips_on(status.as_u16());

        let stream = match upstream.into_stream(move |clean| {
            if clean && !trips {
                circuits.record_success(&origin);
            } else {
                circuits.record_failure(&origin);
            }
        }) {
            Ok(stream) => stream,
            Err(error) => {
                self.record_error(&target.origin, &error);
                return bypass_tagged(error.to_response(&request_id), reason);
            }
        };

        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = status;
        *response.headers_mut() = relay_headers;
        bypass_tagged(response, reason)
    }

    fn record_status(&self, origin: &str, status: StatusCode) {
        if self.circuits.trips_on(status.as_u16()) {
            self.circuits.record_failure(origin);
        } else {
            self.circuits.record_success(origin);
        }
    }

    fn record_error(&self, origin: &str, error: &ProxyError) {
        if error.is_upstream_failure() {
            tracing::warn!(origin, error = %error, "Upstream failure");
            self.circuits.record_failure(origin);
        }
        if matches!(error, ProxyError::Internal(_)) {
            self.stats.record_cache(CacheEvent::Error);
        }
    }
}

/// Configured methods plus GET and HEAD, deduplicated. Unknown tokens are
/// skipped; validation reports them.
fn allowed_methods(configured: &[String]) -> Vec<Method> {
    let mut methods = vec![Method::GET, Method::HEAD];
    for name in configured {
        match Method::from_bytes(name.trim().to_ascii_uppercase().as_bytes()) {
            Ok(method) if !methods.contains(&method) => methods.push(method),
            Ok(_) => {}
            Err(_) => tracing::warn!(method = %name, "Ignoring unknown method"),
        }
    }
    methods
}

fn preflight_response() -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("public, max-age=86400"));
    response
}

/// Rebuild a response from a shared payload.
fn replay(cached: &CachedResponse, cache_tag: &'static str, status_tag: &'static str) -> Response {
    let mut response = Response::new(Body::from(cached.body.clone()));
    *response.status_mut() = cached.status;
    *response.headers_mut() = cached.headers.clone();
    tag(&mut response, cache_tag, status_tag);
    response
}

fn tagged_error(error: &ProxyError, request_id: &str, cache_tag: &'static str, status_tag: &'static str) -> Response {
    let mut response = error.to_response(request_id);
    tag(&mut response, cache_tag, status_tag);
    response
}

fn bypass_tagged(mut response: Response, reason: BypassReason) -> Response {
    tag(&mut response, "BYPASS", "BYPASS");
    if let Some(value) = reason.header_value() {
        response
            .headers_mut()
            .insert(X_PROXY_BYPASS_REASON, HeaderValue::from_static(value));
    }
    response
}

fn tag(response: &mut Response, cache_tag: &'static str, status_tag: &'static str) {
    let headers = response.headers_mut();
    headers.insert(X_PROXY_CACHE, HeaderValue::from_static(cache_tag));
    headers.insert(X_PROXY_STATUS, HeaderValue::from_static(status_tag));
}
