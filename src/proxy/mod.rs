//! Proxy core.
//!
//! # Data Flow
//! ```text
//! ProxyRequest
//!     → dispatch.rs (method, target, circuit, cache, coalescing)
//!     → headers.rs  (strip hop-by-hop and client-identifying headers)
//!     → forward.rs  (pooled reqwest client, size guards, redirect bound)
//!     → headers.rs  (filter upstream response headers)
//!     → Response tagged with X-Proxy-* headers
//! ```
//!
//! Every failure is a `ProxyError` from error.rs.

pub mod dispatch;
pub mod error;
pub mod forward;
pub mod headers;

pub use dispatch::{Dispatcher, ProxyRequest};
pub use error::ProxyError;
pub use forward::Forwarder;
