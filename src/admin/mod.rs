//! Operator API: inspection plus ban and breaker controls.
//!
//! Every route sits behind bearer-token auth and outside the admission
//! middleware.

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::http::server::AppState;

pub fn setup_admin_router(state: AppState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/stats", get(get_stats))
        .route("/admin/breakers", get(get_breakers))
        .route("/admin/breakers/{name}/reset", post(reset_breaker))
        .route("/admin/bans", get(get_bans).post(create_ban))
        .route("/admin/bans/{entity}", delete(remove_ban))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}
