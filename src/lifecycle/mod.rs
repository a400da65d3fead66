//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validated config → shared store → cache, coalescer, circuits,
//!     admission, forwarder → AppState
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     broadcast → listener stops accepting, in-flight requests drain,
//!     background tasks stop, cache snapshot written
//! ```
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Background tasks subscribe to one broadcast channel

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{build_services, Services, StartupError};
