//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters and gauges through the `metrics` facade)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → Prometheus scrape listener (optional)
//! ```
//!
//! # Design Decisions
//! - Security events (denials, bans, breaker transitions) are always logged
//! - Metric calls are no-ops until an exporter is installed, so library
//!   users and tests pay nothing

pub mod logging;
pub mod metrics;
