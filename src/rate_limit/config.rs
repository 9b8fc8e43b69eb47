//! Rate limit policy definitions.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Admission algorithm used for a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Continuous refill, one token per admitted request.
    TokenBucket,
    /// Count of requests in the trailing window.
    #[default]
    SlidingWindow,
    /// Counter reset on aligned window boundaries.
    FixedWindow,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::FixedWindow => "fixed_window",
        };
        f.write_str(name)
    }
}

impl FromStr for Algorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "token_bucket" => Ok(Algorithm::TokenBucket),
            "sliding_window" => Ok(Algorithm::SlidingWindow),
            "fixed_window" => Ok(Algorithm::FixedWindow),
            other => Err(ConfigError::invalid(
                "algorithm",
                format!("unknown algorithm '{}'", other),
            )),
        }
    }
}

/// An immutable, validated rate limit policy.
///
/// Deserialization runs through the same checks as [`RateLimitConfig::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRateLimitConfig")]
pub struct RateLimitConfig {
    max_requests: u32,
    window_seconds: u64,
    algorithm: Algorithm,
    burst_allowance: u32,
    penalty_multiplier: f64,
}

impl RateLimitConfig {
    /// Default multiplier applied to the window once a key is penalized.
    pub const DEFAULT_PENALTY_MULTIPLIER: f64 = 2.0;

    /// Create a sliding-window policy with no burst allowance.
    pub fn new(max_requests: u32, window_seconds: u64) -> Result<Self, ConfigError> {
        if max_requests == 0 {
            return Err(ConfigError::invalid("max_requests", "must be greater than zero"));
        }
        if window_seconds == 0 {
            return Err(ConfigError::invalid("window_seconds", "must be greater than zero"));
        }
        Ok(Self {
            max_requests,
            window_seconds,
            algorithm: Algorithm::default(),
            burst_allowance: 0,
            penalty_multiplier: Self::DEFAULT_PENALTY_MULTIPLIER,
        })
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_burst(mut self, burst_allowance: u32) -> Self {
        self.burst_allowance = burst_allowance;
        self
    }

    /// Set the penalty multiplier. Values below 1.0 (or non-finite) are rejected.
    pub fn with_penalty_multiplier(mut self, multiplier: f64) -> Result<Self, ConfigError> {
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "penalty_multiplier",
                format!("must be a finite value >= 1.0, got {}", multiplier),
            ));
        }
        self.penalty_multiplier = multiplier;
        Ok(self)
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window_seconds(&self) -> u64 {
        self.window_seconds
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn burst_allowance(&self) -> u32 {
        self.burst_allowance
    }

    pub fn penalty_multiplier(&self) -> f64 {
        self.penalty_multiplier
    }

    /// Hard admission ceiling: `max_requests + burst_allowance`.
    pub fn capacity(&self) -> u32 {
        self.max_requests.saturating_add(self.burst_allowance)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    /// Token refill rate per second.
    pub fn refill_rate(&self) -> f64 {
        self.max_requests as f64 / self.window_seconds as f64
    }

    /// Length of the deny-all window applied to repeat offenders.
    pub fn penalty_window(&self) -> Duration {
        Duration::from_secs_f64(self.window_seconds as f64 * self.penalty_multiplier)
    }

    /// Internal constructor for compile-time known presets.
    fn preset(
        max_requests: u32,
        window_seconds: u64,
        algorithm: Algorithm,
        burst_allowance: u32,
        penalty_multiplier: f64,
    ) -> Self {
        Self {
            max_requests,
            window_seconds,
            algorithm,
            burst_allowance,
            penalty_multiplier,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::preset(100, 60, Algorithm::SlidingWindow, 0, Self::DEFAULT_PENALTY_MULTIPLIER)
    }
}

/// Unvalidated wire form of [`RateLimitConfig`].
#[derive(Debug, Clone, Deserialize)]
struct RawRateLimitConfig {
    max_requests: u32,
    window_seconds: u64,
    #[serde(default)]
    algorithm: Algorithm,
    #[serde(default)]
    burst_allowance: u32,
    #[serde(default = "default_penalty_multiplier")]
    penalty_multiplier: f64,
}

fn default_penalty_multiplier() -> f64 {
    RateLimitConfig::DEFAULT_PENALTY_MULTIPLIER
}

impl TryFrom<RawRateLimitConfig> for RateLimitConfig {
    type Error = ConfigError;

    fn try_from(raw: RawRateLimitConfig) -> Result<Self, Self::Error> {
        RateLimitConfig::new(raw.max_requests, raw.window_seconds)?
            .with_algorithm(raw.algorithm)
            .with_burst(raw.burst_allowance)
            .with_penalty_multiplier(raw.penalty_multiplier)
    }
}

/// Limiter-wide housekeeping settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterSettings {
    /// Minimum seconds between two cleanup passes.
    pub cleanup_interval_secs: u64,

    /// Upper bound on tracked keys after a cleanup pass.
    pub max_memory_entries: usize,

    /// Policy used when nothing more specific is configured.
    pub default_limit: RateLimitConfig,
}

impl RateLimiterSettings {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 60,
            max_memory_entries: 10_000,
            default_limit: RateLimitConfig::default(),
        }
    }
}

/// Policies registered for well-known operation kinds.
pub fn builtin_policies() -> Vec<(&'static str, RateLimitConfig)> {
    vec![
        ("api", RateLimitConfig::preset(100, 60, Algorithm::SlidingWindow, 20, 2.0)),
        ("auth", RateLimitConfig::preset(5, 300, Algorithm::SlidingWindow, 0, 3.0)),
        ("upload", RateLimitConfig::preset(10, 3600, Algorithm::FixedWindow, 2, 2.0)),
        ("websocket", RateLimitConfig::preset(50, 60, Algorithm::TokenBucket, 10, 1.5)),
    ]
}
