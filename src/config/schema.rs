//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the guard.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rate_limit::{RateLimitConfig, RateLimiterSettings};
use crate::resilience::CircuitBreakerConfig;
use crate::resources::{ResourceLimits, DEFAULT_SAMPLE_INTERVAL};
use crate::threat::{ThreatDetectorSettings, ThreatProfile, DEFAULT_PROFILE};

/// Root configuration for the guard.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GuardConfig {
    /// HTTP listener for the protected service.
    pub server: ServerConfig,

    /// Admin API settings.
    pub admin: AdminConfig,

    /// Limiter housekeeping and fallback policy.
    pub rate_limiter: RateLimiterSettings,

    /// Rate limit policies per operation kind. A kind may carry one
    /// pattern-less policy plus any number of entity-scoped ones.
    pub limits: BTreeMap<String, Vec<LimitPolicy>>,

    /// Circuit breakers, keyed by operation kind.
    pub circuit_breakers: BTreeMap<String, CircuitBreakerConfig>,

    /// Threat detector capacity settings.
    pub threat_detector: ThreatDetectorSettings,

    /// Extra or overriding threat profiles.
    pub threat_profiles: BTreeMap<String, ThreatProfile>,

    /// Resource sampling and limits.
    pub resources: ResourcesConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Threat profile applied to HTTP requests.
    pub threat_profile: String,

    /// Operation kind used for routes with no explicit mapping.
    pub default_kind: String,

    /// Per-request timeout enforced by the HTTP layer.
    pub request_timeout_secs: u64,

    /// Take the client address from the first `X-Forwarded-For` entry.
    /// Only enable behind a proxy that sets the header.
    pub trust_forwarded_for: bool,

    /// Path prefixes mapped to operation kinds; longest prefix wins.
    pub routes: Vec<KindRoute>,
}

/// Route mapping from a path prefix to an operation kind.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct KindRoute {
    pub path_prefix: String,
    pub kind: String,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Operation kind for a request path.
    pub fn kind_for_path(&self, path: &str) -> &str {
        self.routes
            .iter()
            .filter(|r| path.starts_with(&r.path_prefix))
            .max_by_key(|r| r.path_prefix.len())
            .map(|r| r.kind.as_str())
            .unwrap_or(&self.default_kind)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            threat_profile: DEFAULT_PROFILE.to_string(),
            default_kind: "api".to_string(),
            request_timeout_secs: 30,
            trust_forwarded_for: false,
            routes: Vec::new(),
        }
    }
}

/// A rate limit policy plus the entities it applies to.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LimitPolicy {
    #[serde(flatten)]
    pub limit: RateLimitConfig,

    /// Glob over entity keys (e.g. `"ip:10.*"`). Absent means every entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_pattern: Option<String>,
}

/// Resource monitor configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// Run the background sampler.
    pub enabled: bool,

    /// Seconds between samples.
    pub sample_interval_secs: u64,

    pub limits: ResourceLimits,
}

impl ResourcesConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_secs: DEFAULT_SAMPLE_INTERVAL.as_secs(),
            limits: ResourceLimits::default(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of the pretty format.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Mount the admin routes.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
        }
    }
}
