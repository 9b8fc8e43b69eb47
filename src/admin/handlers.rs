use std::collections::BTreeMap;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::http::server::AppState;
use crate::protection::ProtectionStats;
use crate::resilience::CircuitBreakerStats;
use crate::threat::BanEntry;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub monitoring: bool,
    pub tracked_entities: usize,
    pub active_bans: usize,
}

#[derive(Debug, Deserialize)]
pub struct BanRequest {
    pub entity: String,
    /// Defaults to the configured profile's ban duration.
    pub duration_secs: Option<u64>,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let detector = state.protector.threat_detector();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        monitoring: state.protector.resource_monitor().is_running(),
        tracked_entities: detector.tracked_entities(),
        active_bans: detector.active_bans().len(),
    })
}

pub async fn get_stats(State(state): State<AppState>) -> Json<ProtectionStats> {
    Json(state.protector.get_comprehensive_stats())
}

pub async fn get_breakers(State(state): State<AppState>) -> Json<BTreeMap<String, CircuitBreakerStats>> {
    Json(state.protector.circuit_breakers().all_stats())
}

pub async fn reset_breaker(State(state): State<AppState>, Path(name): Path<String>) -> StatusCode {
    match state.protector.circuit_breaker(&name) {
        Some(breaker) => {
            breaker.reset();
            tracing::info!(breaker = %name, "Circuit breaker reset by operator");
            StatusCode::NO_CONTENT
        }
        None => StatusCode::NOT_FOUND,
    }
}

pub async fn get_bans(State(state): State<AppState>) -> Json<Vec<BanEntry>> {
    Json(state.protector.threat_detector().active_bans())
}

pub async fn create_ban(State(state): State<AppState>, Json(ban): Json<BanRequest>) -> StatusCode {
    if ban.entity.trim().is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    let detector = state.protector.threat_detector();
    let duration = match ban.duration_secs {
        Some(secs) => Duration::from_secs(secs),
        None => detector
            .profile(&state.config.load().server.threat_profile)
            .ban_duration(),
    };
    detector.ban_entity(&ban.entity, duration);
    StatusCode::CREATED
}

pub async fn remove_ban(State(state): State<AppState>, Path(entity): Path<String>) -> StatusCode {
    if state.protector.threat_detector().unban_entity(&entity) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
