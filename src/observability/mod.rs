//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (in-process stats + metrics facade)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → GET /metrics (JSON snapshot)
//!     → GET /metrics/prometheus (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID flows through all subsystems
//! - Metrics are cheap (atomic increments, one short lock)

pub mod logging;
pub mod metrics;
