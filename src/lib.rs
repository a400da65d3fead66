//! CORS relay library: a reverse proxy that forwards `/?url=<target>`
//! requests and wraps them in circuit breaking, response caching and
//! request coalescing.

pub mod admin;
pub mod cache;
pub mod coalesce;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod proxy;
pub mod resilience;
pub mod security;
pub mod store;

pub use config::schema::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
