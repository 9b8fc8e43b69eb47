//! Denial-of-service protection for request-serving applications.
//!
//! [`DoSProtector`] answers one question per request: may this operation
//! proceed right now? It consults, in order, the process resource monitor,
//! the behavioural threat detector, the per-entity rate limiter and the
//! circuit breaker registered for the operation kind.

pub mod admin;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod protection;
pub mod rate_limit;
pub mod resilience;
pub mod resources;
pub mod threat;

pub use config::GuardConfig;
pub use error::{ProtectionError, ResourceKind};
pub use http::GuardServer;
pub use lifecycle::Shutdown;
pub use protection::{DoSProtector, Guard, GuardError, ProtectionResult, ProtectionStats};
pub use rate_limit::{Algorithm, RateLimitConfig, RateLimiter, Subject};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use resources::{ResourceLimits, ResourceMonitor};
pub use threat::{RequestContext, ThreatDetector, ThreatProfile};
