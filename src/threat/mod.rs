//! Threat detection subsystem.
//!
//! # Data Flow
//! ```text
//! RequestContext (caller metadata):
//!     → detector.rs (ban check, append to entity history)
//!     → signals.rs (rate, rapid fire, size, endpoint scan, UA churn, geo)
//!     → detector.rs (sum, cap, exponential smoothing, violations)
//!     → ThreatAssessment
//! ```
//!
//! # Design Decisions
//! - Entities are `user:<id>` when authenticated, `ip:<addr>` otherwise
//! - Signals are trait objects so deployments can add their own
//! - Bans expire lazily on lookup and in periodic cleanup

pub mod context;
pub mod detector;
pub mod profile;
pub mod signals;

pub use context::{GeoInfo, RequestContext};
pub use detector::{
    BanEntry, ThreatAssessment, ThreatDetector, ThreatDetectorSettings, ThreatStats, MAX_BAN_DURATION,
};
pub use profile::{builtin_profiles, ThreatProfile, DEFAULT_PROFILE};
pub use signals::{default_signals, SignalContext, SignalHit, ThreatSignal};
