//! End-to-end admission behaviour of the protector without HTTP.

use std::time::Duration;

use dos_guard::config::{GuardConfig, LimitPolicy};
use dos_guard::error::{ProtectionError, ResourceKind};
use dos_guard::rate_limit::{Algorithm, RateLimitConfig};
use dos_guard::resilience::{CircuitBreakerConfig, CircuitState};
use dos_guard::resources::ProcessSample;
use dos_guard::threat::{RequestContext, DEFAULT_PROFILE};

mod common;

fn ctx(last: u8) -> RequestContext {
    RequestContext::new(common::ip(last)).with_user_agent("flow/1.0")
}

#[test]
fn checks_run_in_order_and_stop_at_first_denial() {
    let mut config = GuardConfig::default();
    config.circuit_breakers.insert(
        "db".to_string(),
        CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        },
    );
    let h = common::harness(&config);
    let limits = RateLimitConfig::new(1, 60).unwrap();

    // breaker open: rate limit charged, breaker rejects
    h.protector.circuit_breaker("db").unwrap().force_open();
    assert!(matches!(
        h.protector.protect("db", Some(&ctx(1)), Some(&limits), DEFAULT_PROFILE),
        Err(ProtectionError::CircuitOpen { .. })
    ));

    // quota exhausted: rate limit rejects before the breaker is consulted
    let rejected_before = h.protector.circuit_breaker("db").unwrap().stats().rejected_calls;
    assert!(matches!(
        h.protector.protect("db", Some(&ctx(1)), Some(&limits), DEFAULT_PROFILE),
        Err(ProtectionError::RateLimited { .. })
    ));
    assert_eq!(h.protector.circuit_breaker("db").unwrap().stats().rejected_calls, rejected_before);

    // banned: threat rejects before the rate limiter
    h.protector
        .threat_detector()
        .ban_entity("ip:198.51.100.1", Duration::from_secs(60));
    assert!(matches!(
        h.protector.protect("db", Some(&ctx(1)), Some(&limits), DEFAULT_PROFILE),
        Err(ProtectionError::ThreatDetected { .. })
    ));

    // memory pressure: resources reject before everything else
    h.sampler.set(ProcessSample {
        memory_mb: 8192.0,
        cpu_percent: 1.0,
    });
    h.protector.resource_monitor().sample_now();
    assert!(matches!(
        h.protector.protect("db", Some(&ctx(1)), Some(&limits), DEFAULT_PROFILE),
        Err(ProtectionError::ResourceExhausted {
            resource: ResourceKind::Memory,
            ..
        })
    ));

    let stats = h.protector.get_comprehensive_stats();
    assert_eq!(stats.total_requests, 4);
    assert_eq!(stats.blocked_requests, 4);
    assert_eq!(stats.circuit_blocks, 1);
    assert_eq!(stats.rate_limit_blocks, 1);
    assert_eq!(stats.threat_blocks, 1);
    assert_eq!(stats.resource_blocks, 1);
}

#[test]
fn burst_from_one_address_gets_auto_banned_then_expires() {
    let h = common::harness(&GuardConfig::default());
    let attacker = ctx(9);

    let mut first_denial = None;
    for i in 0..30 {
        if let Err(e) = h.protector.protect("api", Some(&attacker), None, "strict") {
            assert!(matches!(e, ProtectionError::ThreatDetected { .. }));
            first_denial.get_or_insert(i);
        }
    }
    assert!(first_denial.is_some());

    let detector = h.protector.threat_detector();
    assert!(detector.is_banned("ip:198.51.100.9"));
    assert!(h.protector.get_comprehensive_stats().auto_bans >= 1);

    // other addresses are unaffected
    assert!(h.protector.protect("api", Some(&ctx(10)), None, "strict").is_ok());

    // strict bans last two hours
    h.clock.advance(Duration::from_secs(7201));
    assert!(!detector.is_banned("ip:198.51.100.9"));
}

#[test]
fn unknown_profile_falls_back_to_default() {
    let h = common::harness(&GuardConfig::default());
    let result = h
        .protector
        .protect("api", Some(&ctx(2)), None, "no-such-profile")
        .unwrap();
    assert_eq!(result.threat_score, Some(0.0));
}

#[test]
fn configured_limits_apply_per_entity() {
    let mut config = GuardConfig::default();
    config.limits.insert(
        "search".to_string(),
        vec![LimitPolicy {
            limit: RateLimitConfig::new(2, 10).unwrap().with_algorithm(Algorithm::FixedWindow),
            entity_pattern: None,
        }],
    );
    let h = common::harness(&config);

    for _ in 0..2 {
        h.protector.protect("search", Some(&ctx(3)), None, "lenient").unwrap();
    }
    let denied = h
        .protector
        .protect("search", Some(&ctx(3)), None, "lenient")
        .unwrap_err();
    assert!(denied.retry_after().unwrap() <= Duration::from_secs(10));
    assert!(h.protector.protect("search", Some(&ctx(4)), None, "lenient").is_ok());
}

#[test]
fn breaker_recovers_through_half_open() {
    let mut config = GuardConfig::default();
    config.circuit_breakers.insert(
        "payments".to_string(),
        CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            ..Default::default()
        },
    );
    let h = common::harness(&config);
    let breaker = h.protector.circuit_breaker("payments").unwrap();

    for _ in 0..2 {
        h.protector.protect("payments", None, None, DEFAULT_PROFILE).unwrap();
        breaker.record_failure(Duration::from_millis(5), "upstream");
    }
    assert_eq!(breaker.state(), CircuitState::Open);
    let retry_after = match h.protector.protect("payments", None, None, DEFAULT_PROFILE) {
        Err(ProtectionError::CircuitOpen { retry_after, .. }) => retry_after,
        other => panic!("expected open circuit, got {:?}", other),
    };

    h.clock.advance(retry_after + Duration::from_millis(1));
    h.protector.protect("payments", None, None, DEFAULT_PROFILE).unwrap();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    breaker.record_success(Duration::from_millis(5));
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[test]
fn tracked_entities_stay_bounded() {
    let mut config = GuardConfig::default();
    config.threat_detector.max_tracked_entities = 50;
    let h = common::harness(&config);

    for i in 0..=255u8 {
        let _ = h.protector.protect("api", Some(&ctx(i)), None, "lenient");
    }
    assert!(h.protector.threat_detector().tracked_entities() <= 51);
}
