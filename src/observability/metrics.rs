//! Metrics collection and exposition.
//!
//! # Metrics
//! - `dos_guard_requests_total` (counter): protect() decisions by kind, outcome
//! - `dos_guard_rate_limited_total` (counter): rate limit denials by kind
//! - `dos_guard_threats_total` (counter): threat denials
//! - `dos_guard_bans_total` (counter): bans issued
//! - `dos_guard_circuit_state` (gauge): 0=closed, 1=half_open, 2=open
//! - `dos_guard_tracked_keys` (gauge): rate limiter keys in memory
//! - `dos_guard_process_memory_mb` / `dos_guard_process_cpu_percent` (gauges)

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::resilience::CircuitState;

pub const REQUESTS_TOTAL: &str = "dos_guard_requests_total";
pub const RATE_LIMITED_TOTAL: &str = "dos_guard_rate_limited_total";
pub const THREATS_TOTAL: &str = "dos_guard_threats_total";
pub const BANS_TOTAL: &str = "dos_guard_bans_total";
pub const CIRCUIT_STATE: &str = "dos_guard_circuit_state";
pub const TRACKED_KEYS: &str = "dos_guard_tracked_keys";
pub const PROCESS_MEMORY_MB: &str = "dos_guard_process_memory_mb";
pub const PROCESS_CPU_PERCENT: &str = "dos_guard_process_cpu_percent";

/// Install the Prometheus recorder with an HTTP scrape listener on `addr`.
/// Must run inside a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    describe();
    tracing::info!(address = %addr, "Prometheus exporter listening");
    Ok(())
}

fn describe() {
    describe_counter!(REQUESTS_TOTAL, "Protection decisions by operation kind and outcome");
    describe_counter!(RATE_LIMITED_TOTAL, "Requests denied by the rate limiter");
    describe_counter!(THREATS_TOTAL, "Requests denied by threat detection");
    describe_counter!(BANS_TOTAL, "Entities banned");
    describe_gauge!(CIRCUIT_STATE, "Circuit breaker state (0=closed, 1=half_open, 2=open)");
    describe_gauge!(TRACKED_KEYS, "Rate limiter keys held in memory");
    describe_gauge!(PROCESS_MEMORY_MB, "Resident memory of this process in MiB");
    describe_gauge!(PROCESS_CPU_PERCENT, "CPU usage of this process");
}

pub fn record_request(kind: &str, outcome: &'static str) {
    counter!(REQUESTS_TOTAL, "kind" => kind.to_string(), "outcome" => outcome).increment(1);
}

pub fn record_rate_limited(kind: &str) {
    counter!(RATE_LIMITED_TOTAL, "kind" => kind.to_string()).increment(1);
}

pub fn record_threat() {
    counter!(THREATS_TOTAL).increment(1);
}

pub fn record_ban() {
    counter!(BANS_TOTAL).increment(1);
}

pub fn record_circuit_state(breaker: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    gauge!(CIRCUIT_STATE, "breaker" => breaker.to_string()).set(value);
}

pub fn record_tracked_keys(count: usize) {
    gauge!(TRACKED_KEYS).set(count as f64);
}

pub fn record_process_resources(memory_mb: f64, cpu_percent: f64) {
    gauge!(PROCESS_MEMORY_MB).set(memory_mb);
    gauge!(PROCESS_CPU_PERCENT).set(cpu_percent);
}
