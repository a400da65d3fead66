//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to an origin:
//!     → circuit_breaker.rs (fail fast when the origin's circuit is open)
//!     → timeouts.rs (client / upstream / coalescing deadlines)
//!     → outcome recorded back into the circuit
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - No retries: a failed forward is reported, the circuit absorbs the signal
//! - Circuit breaker prevents hammering an origin that is down

pub mod circuit_breaker;
pub mod timeouts;

pub use circuit_breaker::{CircuitRegistry, CircuitSnapshot, CircuitState};
pub use timeouts::TimeoutBudget;
