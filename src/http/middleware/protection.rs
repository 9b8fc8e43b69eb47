//! Admission control in front of every protected route.
//! Runs `DoSProtector::protect` and feeds response outcomes back into the
//! route's circuit breaker. A request dropped before it answers (timeout,
//! client gone, handler panic) is recorded as a failure.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::http::request::request_context;
use crate::http::server::AppState;

pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";

pub async fn protection_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let config = state.config.load_full();
    let kind = config.server.kind_for_path(req.uri().path()).to_string();
    let ctx = request_context(&req, config.server.trust_forwarded_for);

    let admitted = match state
        .protector
        .protect(&kind, Some(&ctx), None, &config.server.threat_profile)
    {
        Ok(result) => result,
        Err(e) => {
            tracing::debug!(kind = %kind, ip = %ctx.ip_address, reason = e.label(), "Request denied");
            return e.into_response();
        }
    };

    let remaining = admitted.remaining;
    let breaker = state.protector.circuit_breaker(&kind);
    req.extensions_mut().insert(admitted);

    let call = breaker.as_deref().map(|b| b.track());
    let mut response = next.run(req).await;

    // 5xx from the handler counts against the route's breaker
    if let Some(call) = call {
        let status = response.status();
        if status.is_server_error() {
            call.failure(status.as_str());
        } else {
            call.success();
        }
    }

    response
        .headers_mut()
        .insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
    response
}
