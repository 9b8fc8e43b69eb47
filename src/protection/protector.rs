//! The admission orchestrator.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::clock::{self, SharedClock};
use crate::config::GuardConfig;
use crate::error::ProtectionError;
use crate::observability::metrics;
use crate::rate_limit::{builtin_policies, RateLimitConfig, RateLimiter, RateLimiterStats, Subject};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats};
use crate::resources::{ProcessSampler, ResourceMonitor, ResourceStats, StaticSampler, SysinfoSampler};
use crate::threat::{RequestContext, ThreatDetector, ThreatStats};

/// Outcome of an admitted call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtectionResult {
    pub allowed: bool,
    pub kind: String,
    /// Entity the rate limit was charged to.
    pub entity: String,
    pub resource_check: bool,
    /// `false` when no request context was supplied.
    pub threat_check: bool,
    pub rate_limit_check: bool,
    /// `false` when no breaker is registered for the kind.
    pub circuit_breaker_check: bool,
    pub threat_score: Option<f64>,
    /// Signals that fired without reaching the suspicion threshold.
    pub reasons: Vec<String>,
    pub remaining: u32,
}

/// Aggregated statistics across all components.
#[derive(Debug, Clone, Serialize)]
pub struct ProtectionStats {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub blocked_requests: u64,
    pub resource_blocks: u64,
    pub threat_blocks: u64,
    pub rate_limit_blocks: u64,
    pub circuit_blocks: u64,
    pub auto_bans: u64,
    /// Blocked share of all requests.
    pub block_rate: f64,
    /// Threat-blocked share of all requests.
    pub threat_detection_rate: f64,
    pub rate_limiter: RateLimiterStats,
    pub circuit_breakers: BTreeMap<String, CircuitBreakerStats>,
    pub threat_detector: ThreatStats,
    pub resources: ResourceStats,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    allowed: AtomicU64,
    blocked: AtomicU64,
    resource: AtomicU64,
    threat: AtomicU64,
    rate_limit: AtomicU64,
    circuit: AtomicU64,
    auto_bans: AtomicU64,
}

/// Limit kinds and breaker names installed by the last applied config.
#[derive(Debug, Default)]
struct ConfiguredNames {
    limit_kinds: BTreeSet<String>,
    breakers: BTreeSet<String>,
}

/// Composes the resource monitor, threat detector, rate limiter and
/// circuit breakers behind a single [`protect`](Self::protect) call.
#[derive(Debug)]
pub struct DoSProtector {
    rate_limiter: RateLimiter,
    breakers: CircuitBreakerRegistry,
    threat_detector: ThreatDetector,
    resources: ResourceMonitor,
    counters: Counters,
    configured: Mutex<ConfiguredNames>,
    clock: SharedClock,
}

impl DoSProtector {
    /// Wire every component from `config` with the system clock and a
    /// `sysinfo` sampler.
    pub fn from_config(config: &GuardConfig) -> Self {
        let sampler: Box<dyn ProcessSampler> = match SysinfoSampler::new() {
            Ok(sampler) => Box::new(sampler),
            Err(e) => {
                tracing::warn!(error = %e, "Process introspection unavailable, resource limits disabled");
                let unavailable = StaticSampler::default();
                unavailable.fail(e.to_string());
                Box::new(unavailable)
            }
        };
        Self::with_components(config, clock::system(), sampler)
    }

    /// Wire every component from `config` with an explicit clock and sampler.
    pub fn with_components(config: &GuardConfig, clock: SharedClock, sampler: Box<dyn ProcessSampler>) -> Self {
        let protector = Self {
            rate_limiter: RateLimiter::new(config.rate_limiter.clone(), clock.clone()),
            breakers: CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), clock.clone()),
            threat_detector: ThreatDetector::new(config.threat_detector.clone(), clock.clone()),
            resources: ResourceMonitor::new(
                config.resources.limits.clone(),
                config.resources.sample_interval(),
                sampler,
                clock.clone(),
            ),
            counters: Counters::default(),
            configured: Mutex::new(ConfiguredNames::default()),
            clock,
        };

        for (kind, policy) in builtin_policies() {
            protector.rate_limiter.configure_limit(kind, policy, None);
        }
        protector.apply_config(config);
        protector
    }

    /// Re-apply the policy sections of `config`: limits, breakers, threat
    /// profiles and resource limits. Existing per-key state is kept.
    ///
    /// Limit kinds and breakers that an earlier config installed but `config`
    /// no longer names are withdrawn. A withdrawn built-in kind gets its
    /// built-in policy back.
    pub fn apply_config(&self, config: &GuardConfig) {
        let mut configured = self.configured.lock().expect("configured names mutex poisoned");
        let builtins: BTreeMap<&str, RateLimitConfig> = builtin_policies().into_iter().collect();

        for (kind, policies) in &config.limits {
            self.rate_limiter.replace_limits(
                kind,
                policies
                    .iter()
                    .map(|p| (p.limit.clone(), p.entity_pattern.as_deref())),
            );
        }
        for stale in configured.limit_kinds.iter().filter(|k| !config.limits.contains_key(*k)) {
            match builtins.get(stale.as_str()) {
                Some(builtin) => self.rate_limiter.replace_limits(stale, [(builtin.clone(), None)]),
                None => {
                    self.rate_limiter.remove_limits(stale);
                }
            }
            tracing::info!(kind = %stale, "Rate limit policies withdrawn");
        }

        for (name, breaker) in &config.circuit_breakers {
            self.breakers.register(name, breaker.clone());
        }
        for stale in configured.breakers.iter().filter(|n| !config.circuit_breakers.contains_key(*n)) {
            self.breakers.remove(stale);
            tracing::info!(breaker = %stale, "Circuit breaker withdrawn");
        }

        configured.limit_kinds = config.limits.keys().cloned().collect();
        configured.breakers = config.circuit_breakers.keys().cloned().collect();

        for (name, profile) in &config.threat_profiles {
            self.threat_detector.add_profile(name, profile.clone());
        }
        self.resources.set_limits(config.resources.limits.clone());

        tracing::info!(
            limits = config.limits.values().map(Vec::len).sum::<usize>(),
            circuit_breakers = config.circuit_breakers.len(),
            threat_profiles = config.threat_profiles.len(),
            "Protection policies applied"
        );
    }

    /// Decide whether one operation of `kind` may proceed.
    ///
    /// Checks run in a fixed order and stop at the first denial: resources,
    /// threat (only with a context), rate limit, then the breaker registered
    /// for `kind` (if any). Nothing here sleeps or blocks on I/O.
    pub fn protect(
        &self,
        kind: &str,
        context: Option<&RequestContext>,
        custom_limits: Option<&RateLimitConfig>,
        profile_name: &str,
    ) -> Result<ProtectionResult, ProtectionError> {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        let decision = self.evaluate(kind, context, custom_limits, profile_name);

        match &decision {
            Ok(_) => {
                self.counters.allowed.fetch_add(1, Ordering::Relaxed);
                metrics::record_request(kind, "allowed");
            }
            Err(e) => {
                self.counters.blocked.fetch_add(1, Ordering::Relaxed);
                let counter = match e {
                    ProtectionError::ResourceExhausted { .. } => &self.counters.resource,
                    ProtectionError::ThreatDetected { .. } => &self.counters.threat,
                    ProtectionError::RateLimited { .. } => &self.counters.rate_limit,
                    ProtectionError::CircuitOpen { .. } => &self.counters.circuit,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                metrics::record_request(kind, e.label());
            }
        }
        decision
    }

    fn evaluate(
        &self,
        kind: &str,
        context: Option<&RequestContext>,
        custom_limits: Option<&RateLimitConfig>,
        profile_name: &str,
    ) -> Result<ProtectionResult, ProtectionError> {
        self.resources.check()?;
        if let Some(ctx) = context {
            self.resources
                .limits()
                .check_request_size(ctx.request_size)
                .inspect_err(|e| tracing::warn!(kind = %kind, ip = %ctx.ip_address, error = %e, "Request too large"))?;
        }

        let mut threat_score = None;
        let mut reasons = Vec::new();
        if let Some(ctx) = context {
            let profile = self.threat_detector.profile(profile_name);
            let assessment = self.threat_detector.analyze_with_profile(ctx, &profile);

            if assessment.warrants_ban(&profile) {
                self.threat_detector
                    .ban_entity(&assessment.entity, profile.ban_duration());
                self.counters.auto_bans.fetch_add(1, Ordering::Relaxed);
            }
            if assessment.is_suspicious(&profile) {
                metrics::record_threat();
                tracing::warn!(
                    kind = %kind,
                    entity = %assessment.entity,
                    score = assessment.score,
                    reasons = ?assessment.reasons,
                    "Threat detected, request rejected"
                );
                return Err(ProtectionError::ThreatDetected {
                    score: assessment.score,
                    reasons: assessment.reasons,
                });
            }
            threat_score = Some(assessment.score);
            reasons = assessment.reasons;
        }

        let subject = match context {
            Some(ctx) => {
                let subject = Subject::ip(ctx.ip_address);
                match &ctx.user_id {
                    Some(user) => subject.with_user(user.clone()),
                    None => subject,
                }
            }
            None => Subject::global(),
        };
        let admission = self.rate_limiter.try_acquire(kind, &subject, custom_limits)?;

        let breaker = self.breakers.get(kind);
        if let Some(breaker) = &breaker {
            breaker.check()?;
        }

        Ok(ProtectionResult {
            allowed: true,
            kind: kind.to_string(),
            entity: subject.entity_key(),
            resource_check: true,
            threat_check: context.is_some(),
            rate_limit_check: true,
            circuit_breaker_check: breaker.is_some(),
            threat_score,
            reasons,
            remaining: admission.remaining,
        })
    }

    /// Register (or replace) the limit for `kind`, optionally scoped to
    /// entity keys matching `entity_pattern`.
    pub fn configure_limit(&self, kind: &str, config: RateLimitConfig, entity_pattern: Option<&str>) {
        self.rate_limiter.configure_limit(kind, config, entity_pattern);
    }

    /// Opt `name` into circuit breaking. With `None` an existing breaker is
    /// kept, otherwise one is created from the default config.
    pub fn add_circuit_breaker(&self, name: &str, config: Option<CircuitBreakerConfig>) -> Arc<CircuitBreaker> {
        match config {
            Some(config) => self.breakers.register(name, config),
            None => self.breakers.get_or_create(name, None),
        }
    }

    pub fn circuit_breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name)
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn threat_detector(&self) -> &ThreatDetector {
        &self.threat_detector
    }

    pub fn resource_monitor(&self) -> &ResourceMonitor {
        &self.resources
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn get_comprehensive_stats(&self) -> ProtectionStats {
        let total = self.counters.total.load(Ordering::Relaxed);
        let blocked = self.counters.blocked.load(Ordering::Relaxed);
        let threat = self.counters.threat.load(Ordering::Relaxed);
        let rate = |n: u64| if total == 0 { 0.0 } else { n as f64 / total as f64 };

        ProtectionStats {
            total_requests: total,
            allowed_requests: self.counters.allowed.load(Ordering::Relaxed),
            blocked_requests: blocked,
            resource_blocks: self.counters.resource.load(Ordering::Relaxed),
            threat_blocks: threat,
            rate_limit_blocks: self.counters.rate_limit.load(Ordering::Relaxed),
            circuit_blocks: self.counters.circuit.load(Ordering::Relaxed),
            auto_bans: self.counters.auto_bans.load(Ordering::Relaxed),
            block_rate: rate(blocked),
            threat_detection_rate: rate(threat),
            rate_limiter: self.rate_limiter.stats(),
            circuit_breakers: self.breakers.all_stats(),
            threat_detector: self.threat_detector.stats(),
            resources: self.resources.stats(),
        }
    }

    /// Start the background resource sampler. Requires a tokio runtime.
    pub fn start_monitoring(&self) {
        self.resources.start();
    }

    /// Stop the resource sampler and wait for it to exit.
    pub async fn shutdown(&self) {
        self.resources.stop().await;
        tracing::info!("Protector shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::LimitPolicy;
    use crate::resources::{ProcessSample, ResourceLimits};
    use crate::threat::DEFAULT_PROFILE;
    use std::net::IpAddr;

    fn protector() -> (DoSProtector, Arc<ManualClock>, StaticSampler) {
        let clock = Arc::new(ManualClock::new());
        let sampler = StaticSampler::new(ProcessSample { memory_mb: 100.0, cpu_percent: 5.0 });
        let protector = DoSProtector::with_components(&GuardConfig::default(), clock.clone(), Box::new(sampler.clone()));
        (protector, clock, sampler)
    }

    fn ctx(last: u8) -> RequestContext {
        RequestContext::new(IpAddr::from([192, 0, 2, last])).with_user_agent("test/1.0")
    }

    #[test]
    fn builtin_policies_are_installed() {
        let (protector, _, _) = protector();
        let auth = protector.rate_limiter().policy_for("auth", "ip:192.0.2.1");
        assert_eq!(auth.max_requests(), 5);
        assert_eq!(auth.window_seconds(), 300);
    }

    #[test]
    fn allowed_result_reports_checks() {
        let (protector, _, _) = protector();
        let result = protector.protect("api", Some(&ctx(1)), None, DEFAULT_PROFILE).unwrap();
        assert!(result.allowed);
        assert!(result.resource_check && result.threat_check && result.rate_limit_check);
        assert!(!result.circuit_breaker_check);
        assert_eq!(result.entity, "ip:192.0.2.1");
        assert_eq!(result.threat_score, Some(0.0));

        let anonymous = protector.protect("api", None, None, DEFAULT_PROFILE).unwrap();
        assert!(!anonymous.threat_check);
        assert_eq!(anonymous.threat_score, None);
        assert_eq!(anonymous.entity, "global");
    }

    #[test]
    fn user_identity_keys_the_rate_limit() {
        let (protector, _, _) = protector();
        let limits = RateLimitConfig::new(1, 60).unwrap();
        let alice = ctx(1).with_user("alice");
        assert!(protector.protect("search", Some(&alice), Some(&limits), "lenient").is_ok());
        assert!(matches!(
            protector.protect("search", Some(&alice), Some(&limits), "lenient"),
            Err(ProtectionError::RateLimited { ref key, .. }) if key == "search:user:alice"
        ));
        // same address, different user
        assert!(protector.protect("search", Some(&ctx(1).with_user("bob")), Some(&limits), "lenient").is_ok());
    }

    #[test]
    fn resource_breach_wins_over_rate_limit() {
        let (protector, _, sampler) = protector();
        let limits = RateLimitConfig::new(1, 60).unwrap();
        protector.protect("api", None, Some(&limits), DEFAULT_PROFILE).unwrap();

        sampler.set(ProcessSample { memory_mb: 4096.0, cpu_percent: 5.0 });
        protector.resource_monitor().sample_now();
        assert!(matches!(
            protector.protect("api", None, Some(&limits), DEFAULT_PROFILE),
            Err(ProtectionError::ResourceExhausted { .. })
        ));
        let stats = protector.get_comprehensive_stats();
        assert_eq!(stats.resource_blocks, 1);
        assert_eq!(stats.rate_limit_blocks, 0);
    }

    #[test]
    fn oversized_request_is_a_resource_denial() {
        let (protector, _, _) = protector();
        let big = ctx(2).with_request_size(11 * 1024 * 1024);
        match protector.protect("upload", Some(&big), None, DEFAULT_PROFILE) {
            Err(ProtectionError::ResourceExhausted { resource, .. }) => {
                assert_eq!(resource, crate::error::ResourceKind::RequestSize)
            }
            other => panic!("expected request size denial, got {:?}", other),
        }
    }

    #[test]
    fn breaker_runs_last_and_only_when_registered() {
        let (protector, _, _) = protector();
        let breaker = protector.add_circuit_breaker("db", None);
        breaker.force_open();

        assert!(matches!(
            protector.protect("db", None, None, DEFAULT_PROFILE),
            Err(ProtectionError::CircuitOpen { .. })
        ));
        assert!(protector.protect("api", None, None, DEFAULT_PROFILE).is_ok());
        // the rate limiter still charged the rejected call
        assert_eq!(protector.rate_limiter().stats().allowed, 2);
    }

    #[test]
    fn apply_config_updates_policies() {
        let (protector, _, _) = protector();
        let mut config = GuardConfig::default();
        config.limits.insert(
            "api".to_string(),
            vec![LimitPolicy {
                limit: RateLimitConfig::new(2, 10).unwrap(),
                entity_pattern: None,
            }],
        );
        config.resources.limits = ResourceLimits { max_request_size_mb: 0.5, ..Default::default() };
        protector.apply_config(&config);

        assert_eq!(protector.rate_limiter().policy_for("api", "global").max_requests(), 2);
        assert_eq!(protector.resource_monitor().limits().max_request_size_mb, 0.5);
    }

    #[test]
    fn several_policies_per_kind() {
        let (protector, _, _) = protector();
        let mut config = GuardConfig::default();
        config.limits.insert(
            "search".to_string(),
            vec![
                LimitPolicy {
                    limit: RateLimitConfig::new(10, 60).unwrap(),
                    entity_pattern: None,
                },
                LimitPolicy {
                    limit: RateLimitConfig::new(2, 60).unwrap(),
                    entity_pattern: Some("ip:10.*".to_string()),
                },
            ],
        );
        protector.apply_config(&config);

        let limiter = protector.rate_limiter();
        assert_eq!(limiter.policy_for("search", "ip:10.1.2.3").max_requests(), 2);
        assert_eq!(limiter.policy_for("search", "ip:192.0.2.1").max_requests(), 10);
    }

    #[test]
    fn reload_withdraws_removed_limits_and_breakers() {
        let (protector, _, _) = protector();
        let mut config = GuardConfig::default();
        config.limits.insert(
            "api".to_string(),
            vec![LimitPolicy {
                limit: RateLimitConfig::new(2, 10).unwrap(),
                entity_pattern: None,
            }],
        );
        config.limits.insert(
            "reports".to_string(),
            vec![LimitPolicy {
                limit: RateLimitConfig::new(7, 60).unwrap(),
                entity_pattern: Some("user:*".to_string()),
            }],
        );
        config.circuit_breakers.insert("db".to_string(), CircuitBreakerConfig::default());
        protector.apply_config(&config);
        assert_eq!(protector.rate_limiter().policy_for("reports", "user:1").max_requests(), 7);
        assert!(protector.circuit_breaker("db").is_some());

        // breakers created outside the config survive reloads
        protector.circuit_breakers().get_or_create("cache", None);

        protector.apply_config(&GuardConfig::default());

        let limiter = protector.rate_limiter();
        assert_eq!(limiter.policy_for("api", "global").max_requests(), 100);
        assert_eq!(limiter.policy_for("reports", "user:1"), limiter.settings().default_limit);
        assert!(protector.circuit_breaker("db").is_none());
        assert!(protector.circuit_breaker("cache").is_some());
    }

    #[test]
    fn stats_rates() {
        let (protector, _, _) = protector();
        let limits = RateLimitConfig::new(3, 60).unwrap();
        for _ in 0..4 {
            let _ = protector.protect("api", None, Some(&limits), DEFAULT_PROFILE);
        }
        let stats = protector.get_comprehensive_stats();
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.allowed_requests, 3);
        assert_eq!(stats.blocked_requests, 1);
        assert!((stats.block_rate - 0.25).abs() < 1e-9);
        assert_eq!(stats.threat_detection_rate, 0.0);
    }
}
