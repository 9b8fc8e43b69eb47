//! dos-guard server.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ http server ──▶ protection middleware ──▶ protected service
//!                                          │
//!                                          ▼
//!                                     DoSProtector
//!                        resources → threat → rate limit → breaker
//!
//!     config file ──▶ watcher ──▶ reloader ──▶ apply_config + swap
//!     admin API   ──▶ stats, breakers, bans
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use dos_guard::config::{load_config, ConfigWatcher, GuardConfig};
use dos_guard::http::GuardServer;
use dos_guard::lifecycle::{wait_for_signal, Shutdown};
use dos_guard::observability::{logging, metrics};
use dos_guard::protection::DoSProtector;

#[derive(Parser)]
#[command(name = "dos-guard")]
#[command(about = "Rate limiting, threat detection and circuit breaking in front of an HTTP service", long_about = None)]
struct Args {
    /// TOML configuration file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `server.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => GuardConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }

    logging::init_logging(Some(&config.observability.log_level), config.observability.json_logs);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "dos-guard starting");

    tracing::info!(
        bind_address = %config.server.bind_address,
        limits = config.limits.values().map(Vec::len).sum::<usize>(),
        circuit_breakers = config.circuit_breakers.len(),
        threat_profile = %config.server.threat_profile,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let protector = Arc::new(DoSProtector::from_config(&config));
    if config.resources.enabled {
        protector.start_monitoring();
    }

    let listener = TcpListener::bind(&config.server.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let server = GuardServer::new(protector.clone(), config);

    // Keep the watcher alive for the life of the server.
    let _watcher = match &args.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            server.spawn_reloader(updates);
            match watcher.run() {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::warn!(error = %e, "Config watcher unavailable, hot reload disabled");
                    None
                }
            }
        }
        None => None,
    };

    let shutdown = Shutdown::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    server.run(listener, shutdown.subscribe()).await?;
    protector.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
