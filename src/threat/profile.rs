//! Threat scoring profiles.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Name of the profile used when none (or an unknown one) is requested.
pub const DEFAULT_PROFILE: &str = "default";

/// Thresholds and weights for scoring one class of traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreatProfile {
    /// Smoothed score at which requests are rejected.
    pub suspicion_threshold: f64,

    /// Smoothed score at which the entity is banned.
    pub ban_threshold: f64,

    /// Lookback for rate, size, endpoint and user-agent signals, in seconds.
    pub analysis_window: u64,

    /// Suspicious assessments tolerated before a ban.
    pub max_violations: u32,

    /// Ban length in seconds.
    pub ban_duration: u64,

    /// Requests within 10 seconds that count as rapid fire.
    pub rapid_fire_threshold: u32,

    /// Unique-endpoint ratio above which traffic looks like a scan.
    pub pattern_deviation_threshold: f64,

    /// Multiplier for the geographic anomaly contribution.
    pub geographic_anomaly_weight: f64,
}

impl ThreatProfile {
    pub fn analysis_window(&self) -> Duration {
        Duration::from_secs(self.analysis_window)
    }

    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration)
    }

    /// Tighter thresholds for sensitive operations such as authentication.
    pub fn strict() -> Self {
        Self {
            suspicion_threshold: 0.5,
            ban_threshold: 0.8,
            analysis_window: 600,
            max_violations: 5,
            ban_duration: 7200,
            rapid_fire_threshold: 10,
            pattern_deviation_threshold: 0.7,
            geographic_anomaly_weight: 1.5,
        }
    }

    /// Looser thresholds for high-volume, low-risk traffic.
    pub fn lenient() -> Self {
        Self {
            suspicion_threshold: 0.85,
            ban_threshold: 0.95,
            analysis_window: 120,
            max_violations: 20,
            ban_duration: 900,
            rapid_fire_threshold: 50,
            pattern_deviation_threshold: 0.9,
            geographic_anomaly_weight: 0.5,
        }
    }
}

impl Default for ThreatProfile {
    fn default() -> Self {
        Self {
            suspicion_threshold: 0.7,
            ban_threshold: 0.9,
            analysis_window: 300,
            max_violations: 10,
            ban_duration: 3600,
            rapid_fire_threshold: 20,
            pattern_deviation_threshold: 0.8,
            geographic_anomaly_weight: 1.0,
        }
    }
}

/// `default`, `strict` and `lenient`.
pub fn builtin_profiles() -> HashMap<String, ThreatProfile> {
    HashMap::from([
        (DEFAULT_PROFILE.to_string(), ThreatProfile::default()),
        ("strict".to_string(), ThreatProfile::strict()),
        ("lenient".to_string(), ThreatProfile::lenient()),
    ])
}
