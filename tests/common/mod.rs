//! Shared utilities for integration tests: a programmable upstream and a
//! relay bound to an ephemeral port.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{any, get},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use cors_relay::config::ProxyConfig;
use cors_relay::http::AppState;
use cors_relay::lifecycle::startup::build_services_with_store;
use cors_relay::lifecycle::Shutdown;
use cors_relay::store::SharedStore;
use cors_relay::HttpServer;

/// Per-path request counts seen by the mock upstream.
#[derive(Clone, Default)]
pub struct Hits(Arc<Mutex<HashMap<String, usize>>>);

impl Hits {
    fn record(&self, path: &str) {
        let mut map = self.0.lock().unwrap();
        *map.entry(path.to_string()).or_default() += 1;
    }

    pub fn get(&self, path: &str) -> usize {
        self.0.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

pub struct MockUpstream {
    pub addr: SocketAddr,
    pub hits: Hits,
}

impl MockUpstream {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

#[derive(serde::Deserialize)]
struct SlowQuery {
    ms: Option<u64>,
}

/// Start an upstream with:
/// - `/data`            200 JSON
/// - `/slow?ms=N`       200 after N ms
/// - `/cookie`          200 with Set-Cookie
/// - `/cors`            200 with its own Access-Control-Allow-Origin
/// - `/big`             200 with a 4 KiB body
/// - `/status/{code}`   that status
/// - `/redirect/{n}`    302 chain of n hops ending at 200
/// - `/echo`            method and body echoed back
pub async fn start_mock_upstream() -> MockUpstream {
    let hits = Hits::default();
    let app = Router::new()
        .route("/data", get(data))
        .route("/slow", get(slow))
        .route("/cookie", get(cookie))
        .route("/cors", get(cors))
        .route("/big", get(big))
        .route("/status/{code}", any(status))
        .route("/redirect/{n}", get(redirect))
        .route("/echo", any(echo))
        .with_state(hits.clone())
        .layer(axum::middleware::from_fn_with_state(hits.clone(), count_hits));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    MockUpstream { addr, hits }
}

async fn count_hits(
    State(hits): State<Hits>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    hits.record(request.uri().path());
    next.run(request).await
}

async fn data() -> Response {
    (
        [(header::CONTENT_TYPE, "application/json")],
        r#"{"items":[1,2,3]}"#,
    )
        .into_response()
}

async fn slow(Query(query): Query<SlowQuery>) -> &'static str {
    tokio::time::sleep(Duration::from_millis(query.ms.unwrap_or(300))).await;
    "slow body"
}

async fn cookie() -> Response {
    ([(header::SET_COOKIE, "session=abc; Path=/")], "personal").into_response()
}

async fn cors() -> Response {
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "https://only.test")],
        "cors body",
    )
        .into_response()
}

async fn big() -> Vec<u8> {
    vec![b'x'; 4096]
}

async fn status(Path(code): Path<u16>) -> Response {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, format!("status {code}")).into_response()
}

async fn redirect(Path(n): Path<u32>) -> Response {
    if n == 0 {
        "arrived".into_response()
    } else {
        Redirect::to(&format!("/redirect/{}", n - 1)).into_response()
    }
}

async fn echo(method: Method, headers: HeaderMap, body: Bytes) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    format!(
        "{} {} xff={}",
        method,
        String::from_utf8_lossy(&body),
        forwarded
    )
}

/// A running relay.
pub struct Relay {
    pub addr: SocketAddr,
    pub state: AppState,
    pub shutdown: Shutdown,
    pub handle: JoinHandle<std::io::Result<()>>,
}

impl Relay {
    pub fn base(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Proxy URL for `target`.
    pub fn proxy(&self, target: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(target.as_bytes()).collect();
        format!("http://{}/?url={}", self.addr, encoded)
    }

    pub async fn stop(self) {
        self.shutdown.trigger();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
    }
}

/// Relay defaults for tests: ephemeral port, loopback targets allowed,
/// no system proxy, fast polling.
pub fn test_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.target.allow_private_networks = true;
    config.forward.use_system_proxy = false;
    config.dedupe.poll_interval_ms = 10;
    config
}

pub async fn start_relay(tweak: impl FnOnce(&mut ProxyConfig)) -> Relay {
    start_relay_with_store(tweak, None).await
}

pub async fn start_relay_with_store(
    tweak: impl FnOnce(&mut ProxyConfig),
    store: Option<Arc<dyn SharedStore>>,
) -> Relay {
    let mut config = test_config();
    tweak(&mut config);

    let services = build_services_with_store(config, store, None).unwrap();
    let state = services.state.clone();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let (_updates_tx, updates) = mpsc::unbounded_channel();
    let server = HttpServer::new(services);
    let server_shutdown = shutdown.clone();
    let handle = tokio::spawn(async move { server.run(listener, updates, server_shutdown).await });

    Relay {
        addr,
        state,
        shutdown,
        handle,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

/// A port with nothing listening on it.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
