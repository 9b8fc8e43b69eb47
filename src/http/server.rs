//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router with the protected echo service and admin API
//! - Wire up middleware (admission, timeout, tracing)
//! - Serve with connect info so the middleware sees peer addresses
//! - Swap in reloaded configuration without restarting the listener

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::Query,
    http::{Request, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::admin::setup_admin_router;
use crate::config::GuardConfig;
use crate::http::middleware::protection_middleware;
use crate::protection::{DoSProtector, ProtectionResult};

/// Application state injected into handlers and middleware.
#[derive(Clone)]
pub struct AppState {
    pub protector: Arc<DoSProtector>,
    pub config: Arc<ArcSwap<GuardConfig>>,
}

impl AppState {
    pub fn new(protector: Arc<DoSProtector>, config: GuardConfig) -> Self {
        Self {
            protector,
            config: Arc::new(ArcSwap::from_pointee(config)),
        }
    }
}

/// HTTP front end for the protector.
pub struct GuardServer {
    state: AppState,
}

impl GuardServer {
    pub fn new(protector: Arc<DoSProtector>, config: GuardConfig) -> Self {
        Self {
            state: AppState::new(protector, config),
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the Axum router with all middleware layers.
    ///
    /// The admin routes are merged outside the admission middleware so an
    /// operator can still unban or inspect while traffic is being shed.
    #[allow(deprecated)]
    pub fn router(&self) -> Router {
        let config = self.state.config.load();

        let protected = Router::new()
            .route("/", any(echo_handler))
            .route("/{*path}", any(echo_handler))
            .layer(middleware::from_fn_with_state(self.state.clone(), protection_middleware));

        let mut router = protected;
        if config.admin.enabled {
            router = setup_admin_router(self.state.clone()).merge(router);
        }

        router
            .layer(TimeoutLayer::new(config.server.request_timeout()))
            .layer(TraceLayer::new_for_http())
    }

    /// Run the server until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("HTTP server draining connections");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Apply every config delivered on `updates` to the protector and the
    /// shared config. Listener address, timeout and admin mounting are read
    /// once at startup and need a restart.
    pub fn spawn_reloader(&self, mut updates: mpsc::UnboundedReceiver<GuardConfig>) -> JoinHandle<()> {
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(config) = updates.recv().await {
                state.protector.apply_config(&config);
                state.config.store(Arc::new(config));
                tracing::info!("Configuration reloaded");
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct EchoParams {
    /// Respond with this status instead of 200.
    status: Option<u16>,
    /// Hold the response back this long.
    delay_ms: Option<u64>,
}

/// Stand-in for the protected service: echoes what admission decided.
async fn echo_handler(Query(params): Query<EchoParams>, request: Request<Body>) -> Response {
    let status = params
        .status
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK);
    if let Some(delay) = params.delay_ms {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    let admitted = request.extensions().get::<ProtectionResult>();

    let body = json!({
        "method": request.method().as_str(),
        "path": request.uri().path(),
        "kind": admitted.map(|r| r.kind.as_str()),
        "entity": admitted.map(|r| r.entity.as_str()),
        "threat_score": admitted.and_then(|r| r.threat_score),
    });
    (status, Json(body)).into_response()
}
