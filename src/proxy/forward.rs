//! Upstream exchange over a pooled reqwest client.
//!
//! # Responsibilities
//! - Build the upstream client (pooling, timeouts, redirect policy, proxy)
//! - Stream the request body with a size guard
//! - Read responses either fully (cache path) or as a guarded stream
//! - Map client errors onto `ProxyError`

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, StatusCode};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{BoxStream, Stream, StreamExt};
use reqwest::redirect::Policy;
use url::Url;

use crate::config::ProxyConfig;
use crate::proxy::error::ProxyError;
use crate::resilience::TimeoutBudget;

/// Raised inside the request body stream when the caller sends too much.
#[derive(Debug)]
struct BodyLimitExceeded {
    limit: usize,
}

impl fmt::Display for BodyLimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request body exceeds {} bytes", self.limit)
    }
}

impl StdError for BodyLimitExceeded {}

type BoxError = Box<dyn StdError + Send + Sync>;

/// Map a reqwest failure by walking its source chain.
pub fn map_upstream_error(err: &reqwest::Error, max_redirects: usize) -> ProxyError {
    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(limit) = cause.downcast_ref::<BodyLimitExceeded>() {
            return ProxyError::RequestTooLarge { limit: limit.limit };
        }
        source = cause.source();
    }

    if err.is_redirect() {
        ProxyError::RedirectLimit(max_redirects)
    } else if err.is_timeout() {
        ProxyError::UpstreamTimeout(err.to_string())
    } else if err.is_connect() {
        ProxyError::UpstreamUnreachable(err.to_string())
    } else {
        ProxyError::UpstreamUnreachable(format!("upstream exchange failed: {err}"))
    }
}

/// An upstream response whose body has not been read yet.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    inner: reqwest::Response,
    /// HEAD, 1xx, 204 and 304 responses never carry a body, whatever
    /// Content-Length they advertise.
    bodyless: bool,
    max_response_bytes: usize,
    max_redirects: usize,
}

impl UpstreamResponse {
    /// Content-Length advertised by the upstream, if any.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    fn check_advertised_length(&self) -> Result<(), ProxyError> {
        if self.bodyless {
            return Ok(());
        }
        match self.content_length() {
            Some(len) if len > self.max_response_bytes as u64 => Err(ProxyError::ResponseTooLarge {
                limit: self.max_response_bytes,
            }),
            _ => Ok(()),
        }
    }

    /// Read the full body, failing as soon as it outgrows the limit.
    pub async fn collect(mut self) -> Result<(StatusCode, HeaderMap, Bytes), ProxyError> {
        self.check_advertised_length()?;
        let mut buf = BytesMut::new();
        loop {
            let chunk = self
                .inner
                .chunk()
                .await
                .map_err(|e| map_upstream_error(&e, self.max_redirects))?;
            let Some(chunk) = chunk else { break };
            if buf.len() + chunk.len() > self.max_response_bytes {
                return Err(ProxyError::ResponseTooLarge {
                    limit: self.max_response_bytes,
                });
            }
            buf.extend_from_slice(&chunk);
        }
        Ok((self.status, self.headers, buf.freeze()))
    }

    /// Relay the body as a stream. `on_finish` runs once when the stream
    /// ends cleanly (`true`) or fails (`false`); not at all if the caller
    /// drops the stream first.
    pub fn into_stream<F>(self, on_finish: F) -> Result<GuardedBody, ProxyError>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.check_advertised_length()?;
        Ok(GuardedBody {
            inner: self.inner.bytes_stream().boxed(),
            seen: 0,
            limit: self.max_response_bytes,
            on_finish: Some(Box::new(on_finish)),
        })
    }
}

/// Response body stream with a byte cap and a completion hook.
pub struct GuardedBody {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    seen: usize,
    limit: usize,
    on_finish: Option<Box<dyn FnOnce(bool) + Send>>,
}

impl GuardedBody {
    fn finish(&mut self, ok: bool) {
        if let Some(hook) = self.on_finish.take() {
            hook(ok);
        }
    }
}

impl Stream for GuardedBody {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.on_finish.is_none() && self.seen > self.limit {
            return Poll::Ready(None);
        }
        match self.inner.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                self.finish(true);
                Poll::Ready(None)
            }
            Poll::Ready(Some(Ok(chunk))) => {
                self.seen += chunk.len();
                if self.seen > self.limit {
                    tracing::warn!(limit = self.limit, "Upstream response exceeded limit mid-stream");
                    self.finish(false);
                    return Poll::Ready(Some(Err(io::Error::other(format!(
                        "upstream response exceeds {} bytes",
                        self.limit
                    )))));
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                tracing::warn!(error = %e, "Upstream body failed mid-stream");
                self.finish(false);
                Poll::Ready(Some(Err(io::Error::other(e))))
            }
        }
    }
}

/// Pooled client for every upstream exchange.
pub struct Forwarder {
    client: reqwest::Client,
    max_request_bytes: usize,
    max_response_bytes: usize,
    max_redirects: usize,
}

impl Forwarder {
    pub fn new(config: &ProxyConfig, budget: &TimeoutBudget) -> Result<Self, reqwest::Error> {
        let forward = &config.forward;
        let redirects = if forward.follow_redirects {
            Policy::limited(forward.max_redirects)
        } else {
            Policy::none()
        };

        let mut builder = reqwest::Client::builder()
            .redirect(redirects)
            .timeout(budget.upstream)
            .connect_timeout(budget.connect)
            .pool_max_idle_per_host(forward.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(config.timeouts.pool_idle_secs))
            .danger_accept_invalid_certs(!forward.verify_tls);
        if let Some(proxy) = &forward.upstream_proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        } else if !forward.use_system_proxy {
            builder = builder.no_proxy();
        }

        Ok(Self {
            client: builder.build()?,
            max_request_bytes: forward.max_request_bytes,
            max_response_bytes: forward.max_response_bytes,
            max_redirects: forward.max_redirects,
        })
    }

    pub fn max_request_bytes(&self) -> usize {
        self.max_request_bytes
    }

    /// Send one request upstream and wait for the response head.
    pub async fn send(
        &self,
        method: Method,
        target: &Url,
        headers: HeaderMap,
        body: Option<Body>,
    ) -> Result<UpstreamResponse, ProxyError> {
        let declared = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        if declared.is_some_and(|len| len > self.max_request_bytes as u64) {
            return Err(ProxyError::RequestTooLarge {
                limit: self.max_request_bytes,
            });
        }

        let head = method == Method::HEAD;
        let mut request = self.client.request(method, target.clone()).headers(headers);
        if let Some(body) = body {
            request = request.body(reqwest::Body::wrap_stream(limit_body(body, self.max_request_bytes)));
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_upstream_error(&e, self.max_redirects))?;

        let status = response.status();
        Ok(UpstreamResponse {
            status,
            headers: response.headers().clone(),
            bodyless: head || !status_carries_body(status),
            inner: response,
            max_response_bytes: self.max_response_bytes,
            max_redirects: self.max_redirects,
        })
    }
}

fn limit_body(body: Body, limit: usize) -> impl Stream<Item = Result<Bytes, BoxError>> + Send + 'static {
    let mut seen = 0usize;
    body.into_data_stream().map(move |chunk| {
        let chunk = chunk.map_err(|e| Box::new(e) as BoxError)?;
        seen += chunk.len();
        if seen > limit {
            return Err(Box::new(BodyLimitExceeded { limit }) as BoxError);
        }
        Ok(chunk)
    })
}

fn status_carries_body(status: StatusCode) -> bool {
    !(status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED)
}

/// Whether the client request carries a body worth forwarding.
pub fn has_body(headers: &HeaderMap) -> bool {
    headers.contains_key(header::TRANSFER_ENCODING)
        || headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .is_some_and(|len| len > 0)
}
