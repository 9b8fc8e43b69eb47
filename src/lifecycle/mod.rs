//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → server stops accepting → drain → resource sampler stopped
//! ```
//!
//! # Design Decisions
//! - One broadcast channel; every long-running task subscribes
//! - Ordered shutdown: stop accept, drain, stop background tasks

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::wait_for_signal;
