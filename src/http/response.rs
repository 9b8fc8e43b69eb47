//! Denial responses.
//!
//! # Design Decisions
//! - Status follows the denial: 429 rate limit, 503 circuit open or process
//!   pressure, 413 oversized request, 403 threat
//! - `Retry-After` is whole seconds, rounded up, whenever the denial has one
//! - The JSON body repeats the denial reason so operators can tell denials apart

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::{ProtectionError, ResourceKind};

pub fn status_for(error: &ProtectionError) -> StatusCode {
    match error {
        ProtectionError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        ProtectionError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ProtectionError::ResourceExhausted {
            resource: ResourceKind::RequestSize,
            ..
        } => StatusCode::PAYLOAD_TOO_LARGE,
        ProtectionError::ResourceExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ProtectionError::ThreatDetected { .. } => StatusCode::FORBIDDEN,
    }
}

impl IntoResponse for ProtectionError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        let retry_after = self.retry_after().map(|d| d.as_secs_f64().ceil() as u64);
        let body = json!({
            "error": self.label(),
            "message": self.to_string(),
            "retry_after_secs": retry_after,
        });

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn rate_limit_maps_to_429_with_retry_after() {
        let response = ProtectionError::RateLimited {
            key: "api:ip:1.2.3.4".to_string(),
            limit: 10,
            window: Duration::from_secs(60),
            retry_after: Duration::from_millis(1500),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
    }

    #[test]
    fn threat_has_no_retry_after() {
        let response = ProtectionError::ThreatDetected {
            score: 0.8,
            reasons: vec!["rapid fire: 30 requests in 10s".to_string()],
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }

    #[test]
    fn request_size_is_413() {
        let error = ProtectionError::ResourceExhausted {
            resource: ResourceKind::RequestSize,
            current: 12.0,
            limit: 10.0,
            retry_after: Duration::from_secs(60),
        };
        assert_eq!(status_for(&error), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
