//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection (peer address captured)
//!     → server.rs      request id, tracing, CORS, client timeout, draining
//!     → proxy route    admission control, then request.rs (query, request id)
//!                      → proxy::Dispatcher
//!     → diagnostics.rs health, metrics, circuit state
//!     → admin          bearer-guarded operations
//! ```

pub mod diagnostics;
pub mod request;
pub mod server;

pub use request::ProxyQuery;
pub use server::{AppState, HttpServer};
