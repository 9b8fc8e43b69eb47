//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to a dependency:
//!     → registry.rs (look up / create the breaker for the dependency name)
//!     → circuit_breaker.rs (permission check, run, record outcome)
//!     → backoff.rs (open-state timeout when the breaker trips)
//! ```
//!
//! # Design Decisions
//! - Breakers are opt-in per dependency; no breaker means no check
//! - Fail fast while open; the caller gets a retry_after, never a sleep
//! - All resilience logic is composable around sync closures and futures

pub mod backoff;
pub mod circuit_breaker;
pub mod registry;

pub use circuit_breaker::{
    CallError, CallGuard, CallRecord, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
    StateCallback, MAX_OPEN_DURATION,
};
pub use registry::CircuitBreakerRegistry;
