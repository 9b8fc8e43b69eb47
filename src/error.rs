//! Protection decision errors.
//!
//! Each denial carries enough context for the caller to schedule a retry
//! without looking at limiter or breaker internals.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Resource that breached its configured ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Memory,
    Cpu,
    RequestSize,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Memory => write!(f, "memory"),
            ResourceKind::Cpu => write!(f, "cpu"),
            ResourceKind::RequestSize => write!(f, "request size"),
        }
    }
}

/// A denied protection decision.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtectionError {
    /// Quota exhausted or penalty window active for the tracking key.
    #[error("rate limit exceeded for {key} ({limit} requests per {window:?}), retry after {retry_after:?}")]
    RateLimited {
        key: String,
        limit: u32,
        window: Duration,
        retry_after: Duration,
    },

    /// The breaker registered for the operation kind is open.
    #[error("circuit breaker '{name}' is open, retry after {retry_after:?}")]
    CircuitOpen { name: String, retry_after: Duration },

    /// Process memory, CPU or request size is over its limit.
    #[error("{resource} limit exceeded ({current:.1} > {limit:.1}), retry after {retry_after:?}")]
    ResourceExhausted {
        resource: ResourceKind,
        current: f64,
        limit: f64,
        retry_after: Duration,
    },

    /// The smoothed threat score reached the profile's suspicion threshold.
    #[error("threat detected (score {score:.2}): {}", reasons.join(", "))]
    ThreatDetected { score: f64, reasons: Vec<String> },
}

impl ProtectionError {
    /// Advisory delay before retrying, if the denial is time-bound.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProtectionError::RateLimited { retry_after, .. }
            | ProtectionError::CircuitOpen { retry_after, .. }
            | ProtectionError::ResourceExhausted { retry_after, .. } => Some(*retry_after),
            ProtectionError::ThreatDetected { .. } => None,
        }
    }

    /// Short machine-readable label, used for metrics and response bodies.
    pub fn label(&self) -> &'static str {
        match self {
            ProtectionError::RateLimited { .. } => "rate_limited",
            ProtectionError::CircuitOpen { .. } => "circuit_open",
            ProtectionError::ResourceExhausted { .. } => "resource_exhausted",
            ProtectionError::ThreatDetected { .. } => "threat_detected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_is_absent_for_threats() {
        let err = ProtectionError::ThreatDetected {
            score: 0.91,
            reasons: vec!["rapid fire".into(), "endpoint scan".into()],
        };
        assert_eq!(err.retry_after(), None);
        assert_eq!(err.to_string(), "threat detected (score 0.91): rapid fire, endpoint scan");
    }

    #[test]
    fn resource_error_formats_values() {
        let err = ProtectionError::ResourceExhausted {
            resource: ResourceKind::Memory,
            current: 2048.0,
            limit: 1024.0,
            retry_after: Duration::from_secs(60),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
        assert!(err.to_string().starts_with("memory limit exceeded (2048.0 > 1024.0)"));
        assert_eq!(err.label(), "resource_exhausted");
    }
}
