//! Protection orchestrator.
//!
//! # Data Flow
//! ```text
//! protect(kind, context?, custom_limits?, profile):
//!     → resources (snapshot vs limits, request size)
//!     → threat (score, auto-ban, reject if suspicious)
//!     → rate_limit (charge the entity's quota)
//!     → resilience (breaker for `kind`, if registered)
//!     → ProtectionResult | ProtectionError
//! ```
//!
//! # Design Decisions
//! - Fail fast: the first denial wins and later checks never run
//! - No component lock is held while another component is consulted
//! - The guard feeds work outcomes back into the matching breaker

pub mod guard;
pub mod protector;

pub use guard::{Guard, GuardError};
pub use protector::{DoSProtector, ProtectionResult, ProtectionStats};
