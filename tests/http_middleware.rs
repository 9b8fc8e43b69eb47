//! HTTP surface: status mapping, breaker feedback and the admin API.

use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use serde_json::Value;
use tokio::net::TcpListener;
use tower::ServiceExt;

use dos_guard::config::{GuardConfig, KindRoute, LimitPolicy};
use dos_guard::http::{GuardServer, X_RATELIMIT_REMAINING};
use dos_guard::lifecycle::Shutdown;
use dos_guard::rate_limit::{Algorithm, RateLimitConfig};
use dos_guard::resilience::{CircuitBreakerConfig, CircuitState};
use dos_guard::resources::ProcessSample;
use dos_guard::threat::MAX_BAN_DURATION;

mod common;

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn rate_limited_requests_get_429_with_retry_after() {
    let mut config = GuardConfig::default();
    config.limits.insert(
        "api".to_string(),
        vec![LimitPolicy {
            limit: RateLimitConfig::new(2, 60).unwrap().with_algorithm(Algorithm::FixedWindow),
            entity_pattern: None,
        }],
    );
    let h = common::harness(&config);
    let router = GuardServer::new(h.protector.clone(), config).router();

    let first = router.clone().oneshot(common::request_from(common::ip(1), "/items")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()[X_RATELIMIT_REMAINING], "1");
    let body = json_body(first).await;
    assert_eq!(body["kind"], "api");
    assert_eq!(body["entity"], "ip:198.51.100.1");

    router.clone().oneshot(common::request_from(common::ip(1), "/items")).await.unwrap();
    let denied = router.clone().oneshot(common::request_from(common::ip(1), "/items")).await.unwrap();
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = denied.headers()[header::RETRY_AFTER].to_str().unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry_after));
    assert_eq!(json_body(denied).await["error"], "rate_limited");

    // a different client still has quota
    let other = router.oneshot(common::request_from(common::ip(2), "/items")).await.unwrap();
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn routes_map_paths_to_kinds() {
    let mut config = GuardConfig::default();
    config.server.routes = vec![
        KindRoute { path_prefix: "/auth".to_string(), kind: "auth".to_string() },
        KindRoute { path_prefix: "/auth/admin".to_string(), kind: "admin-auth".to_string() },
    ];
    let h = common::harness(&config);
    let router = GuardServer::new(h.protector.clone(), config).router();

    let login = router.clone().oneshot(common::request_from(common::ip(3), "/auth/login")).await.unwrap();
    assert_eq!(json_body(login).await["kind"], "auth");
    let nested = router.oneshot(common::request_from(common::ip(3), "/auth/admin/x")).await.unwrap();
    assert_eq!(json_body(nested).await["kind"], "admin-auth");
}

#[tokio::test]
async fn banned_client_gets_403() {
    let config = GuardConfig::default();
    let h = common::harness(&config);
    h.protector
        .threat_detector()
        .ban_entity("ip:198.51.100.4", Duration::from_secs(600));
    let router = GuardServer::new(h.protector.clone(), config).router();

    let response = router.oneshot(common::request_from(common::ip(4), "/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(response.headers().get(header::RETRY_AFTER).is_none());
    assert_eq!(json_body(response).await["error"], "threat_detected");
}

#[tokio::test]
async fn resource_pressure_gets_503_and_oversized_body_413() {
    let config = GuardConfig::default();
    let h = common::harness(&config);
    let router = GuardServer::new(h.protector.clone(), config).router();

    let mut big = common::request_from(common::ip(5), "/upload");
    big.headers_mut()
        .insert(header::CONTENT_LENGTH, (64 * 1024 * 1024).to_string().parse().unwrap());
    let response = router.clone().oneshot(big).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    h.sampler.set(ProcessSample { memory_mb: 10.0, cpu_percent: 99.0 });
    h.protector.resource_monitor().sample_now();
    let response = router.oneshot(common::request_from(common::ip(5), "/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()[header::RETRY_AFTER], "60");
}

#[tokio::test]
async fn server_errors_trip_the_route_breaker() {
    let mut config = GuardConfig::default();
    config.circuit_breakers.insert(
        "api".to_string(),
        CircuitBreakerConfig { failure_threshold: 2, ..Default::default() },
    );
    let h = common::harness(&config);
    let router = GuardServer::new(h.protector.clone(), config).router();

    for _ in 0..2 {
        let response = router
            .clone()
            .oneshot(common::request_from(common::ip(6), "/orders?status=502"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
    let breaker = h.protector.circuit_breaker("api").unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);

    let response = router.oneshot(common::request_from(common::ip(6), "/orders")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["error"], "circuit_open");
}

#[tokio::test(start_paused = true)]
async fn timed_out_requests_count_as_breaker_failures() {
    let mut config = GuardConfig::default();
    config.server.request_timeout_secs = 1;
    config.circuit_breakers.insert(
        "api".to_string(),
        CircuitBreakerConfig { failure_threshold: 1, ..Default::default() },
    );
    let h = common::harness(&config);
    let router = GuardServer::new(h.protector.clone(), config).router();

    let response = router
        .oneshot(common::request_from(common::ip(8), "/slow?delay_ms=1500"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);

    let breaker = h.protector.circuit_breaker("api").unwrap();
    assert_eq!(breaker.stats().total_failures, 1);
    assert_eq!(breaker.recent_calls(1)[0].error_kind.as_deref(), Some("abandoned"));
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test]
async fn admin_requires_bearer_key() {
    let config = common::admin_config();
    let h = common::harness(&config);
    let router = GuardServer::new(h.protector.clone(), config).router();

    let anonymous = Request::builder().uri("/admin/stats").body(Body::empty()).unwrap();
    assert_eq!(router.clone().oneshot(anonymous).await.unwrap().status(), StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .uri("/admin/stats")
        .header(header::AUTHORIZATION, "Bearer nope")
        .body(Body::empty())
        .unwrap();
    assert_eq!(router.clone().oneshot(wrong).await.unwrap().status(), StatusCode::UNAUTHORIZED);

    let authorized = Request::builder()
        .uri("/admin/stats")
        .header(header::AUTHORIZATION, format!("Bearer {}", common::ADMIN_KEY))
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(authorized).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["total_requests"], 0);
}

#[tokio::test]
async fn admin_can_ban_and_unban() {
    let config = common::admin_config();
    let h = common::harness(&config);
    let router = GuardServer::new(h.protector.clone(), config).router();
    let bearer = format!("Bearer {}", common::ADMIN_KEY);

    let ban = Request::builder()
        .method("POST")
        .uri("/admin/bans")
        .header(header::AUTHORIZATION, &bearer)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"entity":"ip:198.51.100.7","duration_secs":120}"#))
        .unwrap();
    assert_eq!(router.clone().oneshot(ban).await.unwrap().status(), StatusCode::CREATED);

    let blocked = router.clone().oneshot(common::request_from(common::ip(7), "/")).await.unwrap();
    assert_eq!(blocked.status(), StatusCode::FORBIDDEN);

    let list = Request::builder()
        .uri("/admin/bans")
        .header(header::AUTHORIZATION, &bearer)
        .body(Body::empty())
        .unwrap();
    let bans = json_body(router.clone().oneshot(list).await.unwrap()).await;
    assert_eq!(bans[0]["entity"], "ip:198.51.100.7");

    let unban = Request::builder()
        .method("DELETE")
        .uri("/admin/bans/ip:198.51.100.7")
        .header(header::AUTHORIZATION, &bearer)
        .body(Body::empty())
        .unwrap();
    assert_eq!(router.clone().oneshot(unban).await.unwrap().status(), StatusCode::NO_CONTENT);

    let allowed = router.oneshot(common::request_from(common::ip(7), "/")).await.unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);
}

#[tokio::test]
async fn admin_ban_duration_is_clamped() {
    let config = common::admin_config();
    let h = common::harness(&config);
    let router = GuardServer::new(h.protector.clone(), config).router();

    let ban = Request::builder()
        .method("POST")
        .uri("/admin/bans")
        .header(header::AUTHORIZATION, format!("Bearer {}", common::ADMIN_KEY))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(format!(r#"{{"entity":"user:forever","duration_secs":{}}}"#, u64::MAX)))
        .unwrap();
    assert_eq!(router.oneshot(ban).await.unwrap().status(), StatusCode::CREATED);
    assert_eq!(
        h.protector.threat_detector().ban_remaining("user:forever"),
        Some(MAX_BAN_DURATION)
    );
}

#[tokio::test]
async fn serves_over_tcp_until_shutdown() {
    let config = GuardConfig::default();
    let h = common::harness(&config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let server = GuardServer::new(h.protector.clone(), config);
    let handle = tokio::spawn(server.run(listener, shutdown.subscribe()));

    let response = reqwest::get(format!("http://{}/hello", addr)).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(response.headers().contains_key(X_RATELIMIT_REMAINING));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["entity"], "ip:127.0.0.1");

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(h.protector.get_comprehensive_stats().allowed_requests, 1);
}
