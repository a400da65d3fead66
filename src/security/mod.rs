//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming proxy request:
//!     → client_ip.rs (peer or first X-Forwarded-For hop, normalized)
//!     → admission.rs
//!         whitelist.rs   exact addresses and CIDR ranges bypass all checks
//!         abuse.rs       spike detection and temporary blocks
//!         rate_limit.rs  daily quota, then sliding window
//!         origin.rs      origin blocklist and per-origin usage
//!     → target.rs (scheme, host, length, private address checks)
//!     → Pass to dispatch
//! ```
//!
//! # Design Decisions
//! - Fail closed: reject on any admission or validation failure
//! - No trust in client input; forwarded headers only when configured
//! - Counters are per process and swept periodically

pub mod abuse;
pub mod admission;
pub mod client_ip;
pub mod origin;
pub mod rate_limit;
pub mod target;
pub mod whitelist;

pub use admission::{admission_middleware, AdmissionControl, AdmissionPolicy};
pub use target::Target;
pub use whitelist::Whitelist;
