//! Shared utilities for integration tests.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::Request;

use dos_guard::clock::ManualClock;
use dos_guard::config::GuardConfig;
use dos_guard::protection::DoSProtector;
use dos_guard::resources::{ProcessSample, StaticSampler};

pub const ADMIN_KEY: &str = "test-admin-key";

/// A protector on a manual clock with a scripted process sampler.
pub struct Harness {
    pub protector: Arc<DoSProtector>,
    pub clock: Arc<ManualClock>,
    pub sampler: StaticSampler,
}

pub fn harness(config: &GuardConfig) -> Harness {
    let clock = Arc::new(ManualClock::new());
    let sampler = StaticSampler::new(ProcessSample {
        memory_mb: 128.0,
        cpu_percent: 5.0,
    });
    let protector = Arc::new(DoSProtector::with_components(
        config,
        clock.clone(),
        Box::new(sampler.clone()),
    ));
    Harness {
        protector,
        clock,
        sampler,
    }
}

/// Config with the admin API mounted under [`ADMIN_KEY`].
#[allow(dead_code)]
pub fn admin_config() -> GuardConfig {
    let mut config = GuardConfig::default();
    config.admin.enabled = true;
    config.admin.api_key = ADMIN_KEY.to_string();
    config
}

/// GET `uri` as if it arrived from `ip`.
#[allow(dead_code)]
pub fn request_from(ip: IpAddr, uri: &str) -> Request<Body> {
    let mut request = Request::builder()
        .uri(uri)
        .header("user-agent", "integration-test/1.0")
        .body(Body::empty())
        .unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::new(ip, 40000)));
    request
}

#[allow(dead_code)]
pub fn ip(last: u8) -> IpAddr {
    IpAddr::from([198, 51, 100, last])
}
