//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde and the policy constructors handle syntax)
//! - Validate value ranges (thresholds in range, intervals > 0, addresses parse)
//! - Check references (the server's threat profile must exist)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GuardConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::GuardConfig;
use crate::resilience::{CircuitBreakerConfig, MAX_OPEN_DURATION};
use crate::threat::{builtin_profiles, ThreatProfile, MAX_BAN_DURATION};

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &GuardConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "server.bind_address",
            format!("'{}' is not a socket address", config.server.bind_address),
        ));
    }
    if config.server.request_timeout_secs == 0 {
        errors.push(ValidationError::new("server.request_timeout_secs", "must be greater than zero"));
    }
    for (i, route) in config.server.routes.iter().enumerate() {
        if !route.path_prefix.starts_with('/') {
            errors.push(ValidationError::new(
                format!("server.routes[{}].path_prefix", i),
                "must start with '/'",
            ));
        }
        if route.kind.is_empty() {
            errors.push(ValidationError::new(format!("server.routes[{}].kind", i), "must not be empty"));
        }
    }
    if config.server.default_kind.is_empty() {
        errors.push(ValidationError::new("server.default_kind", "must not be empty"));
    }
    if !config.threat_profiles.contains_key(&config.server.threat_profile)
        && !builtin_profiles().contains_key(&config.server.threat_profile)
    {
        errors.push(ValidationError::new(
            "server.threat_profile",
            format!("unknown profile '{}'", config.server.threat_profile),
        ));
    }

    if config.admin.enabled && config.admin.api_key.trim().is_empty() {
        errors.push(ValidationError::new("admin.api_key", "required when admin is enabled"));
    }

    if config.observability.metrics_enabled && config.observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if config.rate_limiter.cleanup_interval_secs == 0 {
        errors.push(ValidationError::new("rate_limiter.cleanup_interval_secs", "must be greater than zero"));
    }
    if config.rate_limiter.max_memory_entries == 0 {
        errors.push(ValidationError::new("rate_limiter.max_memory_entries", "must be greater than zero"));
    }

    for (kind, policies) in &config.limits {
        for (i, policy) in policies.iter().enumerate() {
            if policy.entity_pattern.as_deref().is_some_and(|p| p.trim().is_empty()) {
                errors.push(ValidationError::new(
                    format!("limits.{}[{}].entity_pattern", kind, i),
                    "must not be empty when present",
                ));
            }
            let duplicate = policies[..i]
                .iter()
                .any(|earlier| earlier.entity_pattern == policy.entity_pattern);
            if duplicate {
                errors.push(ValidationError::new(
                    format!("limits.{}[{}].entity_pattern", kind, i),
                    "duplicates an earlier policy for this kind",
                ));
            }
        }
    }

    for (name, breaker) in &config.circuit_breakers {
        validate_breaker(&format!("circuit_breakers.{}", name), breaker, &mut errors);
    }

    if config.threat_detector.max_tracked_entities == 0 {
        errors.push(ValidationError::new("threat_detector.max_tracked_entities", "must be greater than zero"));
    }
    for (name, profile) in &config.threat_profiles {
        validate_profile(&format!("threat_profiles.{}", name), profile, &mut errors);
    }

    let resources = &config.resources;
    if resources.sample_interval_secs == 0 {
        errors.push(ValidationError::new("resources.sample_interval_secs", "must be greater than zero"));
    }
    for (field, value) in [
        ("max_memory_mb", resources.limits.max_memory_mb),
        ("max_cpu_percent", resources.limits.max_cpu_percent),
        ("max_request_size_mb", resources.limits.max_request_size_mb),
        ("request_timeout_seconds", resources.limits.request_timeout_seconds),
    ] {
        if !value.is_finite() || value <= 0.0 {
            errors.push(ValidationError::new(
                format!("resources.limits.{}", field),
                "must be a positive number",
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_breaker(prefix: &str, config: &CircuitBreakerConfig, errors: &mut Vec<ValidationError>) {
    if config.failure_threshold == 0 {
        errors.push(ValidationError::new(format!("{prefix}.failure_threshold"), "must be greater than zero"));
    }
    if config.success_threshold == 0 {
        errors.push(ValidationError::new(format!("{prefix}.success_threshold"), "must be greater than zero"));
    }
    let max_secs = MAX_OPEN_DURATION.as_secs_f64();
    for (field, value) in [
        ("timeout_seconds", config.timeout_seconds),
        ("max_wait_time", config.max_wait_time),
        ("slow_call_threshold", config.slow_call_threshold),
    ] {
        if !value.is_finite() || value <= 0.0 || value > max_secs {
            errors.push(ValidationError::new(
                format!("{prefix}.{field}"),
                format!("must be in (0, {max_secs}] seconds"),
            ));
        }
    }
    if config.max_wait_time < config.timeout_seconds {
        errors.push(ValidationError::new(
            format!("{prefix}.max_wait_time"),
            "must not be shorter than timeout_seconds",
        ));
    }
    for (field, rate) in [
        ("failure_rate_threshold", config.failure_rate_threshold),
        ("slow_call_rate_threshold", config.slow_call_rate_threshold),
    ] {
        if rate.is_nan() || rate <= 0.0 || rate > 1.0 {
            errors.push(ValidationError::new(format!("{prefix}.{field}"), "must be in (0, 1]"));
        }
    }
}

fn validate_profile(prefix: &str, profile: &ThreatProfile, errors: &mut Vec<ValidationError>) {
    for (field, value) in [
        ("suspicion_threshold", profile.suspicion_threshold),
        ("ban_threshold", profile.ban_threshold),
        ("pattern_deviation_threshold", profile.pattern_deviation_threshold),
    ] {
        if !(0.0..=1.0).contains(&value) {
            errors.push(ValidationError::new(format!("{prefix}.{field}"), "must be in [0, 1]"));
        }
    }
    if profile.suspicion_threshold > profile.ban_threshold {
        errors.push(ValidationError::new(
            format!("{prefix}.ban_threshold"),
            "must not be below suspicion_threshold",
        ));
    }
    if profile.analysis_window == 0 {
        errors.push(ValidationError::new(format!("{prefix}.analysis_window"), "must be greater than zero"));
    }
    if profile.ban_duration == 0 || profile.ban_duration > MAX_BAN_DURATION.as_secs() {
        errors.push(ValidationError::new(
            format!("{prefix}.ban_duration"),
            format!("must be in [1, {}] seconds", MAX_BAN_DURATION.as_secs()),
        ));
    }
    if profile.geographic_anomaly_weight < 0.0 {
        errors.push(ValidationError::new(
            format!("{prefix}.geographic_anomaly_weight"),
            "must not be negative",
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitPolicy;
    use crate::rate_limit::RateLimitConfig;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&GuardConfig::default()).is_ok());
    }

    #[test]
    fn breaker_ranges() {
        let mut config = GuardConfig::default();
        config.circuit_breakers.insert(
            "db".to_string(),
            CircuitBreakerConfig {
                failure_threshold: 0,
                failure_rate_threshold: 1.5,
                max_wait_time: 1.0,
                ..Default::default()
            },
        );
        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "circuit_breakers.db.failure_threshold",
                "circuit_breakers.db.max_wait_time",
                "circuit_breakers.db.failure_rate_threshold",
            ]
        );
    }

    #[test]
    fn unbounded_breaker_durations_rejected() {
        let mut config = GuardConfig::default();
        config.circuit_breakers.insert(
            "db".to_string(),
            CircuitBreakerConfig {
                timeout_seconds: f64::INFINITY,
                max_wait_time: f64::INFINITY,
                slow_call_threshold: f64::NAN,
                ..Default::default()
            },
        );
        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "circuit_breakers.db.timeout_seconds",
                "circuit_breakers.db.max_wait_time",
                "circuit_breakers.db.slow_call_threshold",
            ]
        );

        config.circuit_breakers.insert(
            "db".to_string(),
            CircuitBreakerConfig {
                timeout_seconds: 1e12,
                max_wait_time: 1e12,
                ..Default::default()
            },
        );
        assert_eq!(validate_config(&config).unwrap_err().len(), 2);
    }

    #[test]
    fn ban_duration_is_bounded() {
        let mut config = GuardConfig::default();
        config.threat_profiles.insert(
            "custom".to_string(),
            ThreatProfile {
                ban_duration: u64::MAX,
                ..ThreatProfile::strict()
            },
        );
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "threat_profiles.custom.ban_duration");

        config.threat_profiles.get_mut("custom").unwrap().ban_duration = MAX_BAN_DURATION.as_secs();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn duplicate_limit_patterns() {
        let policy = |pattern: Option<&str>| LimitPolicy {
            limit: RateLimitConfig::new(10, 60).unwrap(),
            entity_pattern: pattern.map(str::to_string),
        };
        let mut config = GuardConfig::default();
        config.limits.insert(
            "api".to_string(),
            vec![policy(None), policy(Some("ip:10.*")), policy(None)],
        );
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "limits.api[2].entity_pattern");
    }

    #[test]
    fn unknown_server_profile() {
        let mut config = GuardConfig::default();
        config.server.threat_profile = "custom".to_string();
        assert_eq!(validate_config(&config).unwrap_err()[0].field, "server.threat_profile");

        config.threat_profiles.insert("custom".to_string(), ThreatProfile::strict());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn admin_requires_key() {
        let mut config = GuardConfig::default();
        config.admin.enabled = true;
        config.admin.api_key = "  ".to_string();
        assert_eq!(validate_config(&config).unwrap_err()[0].field, "admin.api_key");
    }
}
