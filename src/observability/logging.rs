//! Structured logging.
//!
//! # Design Decisions
//! - `RUST_LOG` wins over the configured level when set
//! - JSON format for production, pretty format for development

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when neither `RUST_LOG` nor a config level is given.
pub const DEFAULT_FILTER: &str = "dos_guard=info,tower_http=info";

/// Install the global subscriber. Calling it twice is harmless; the second
/// call reports that a subscriber already exists and is ignored.
pub fn init_logging(level: Option<&str>, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directive = match level {
            Some(level) => format!("dos_guard={level},tower_http={level}"),
            None => DEFAULT_FILTER.to_string(),
        };
        EnvFilter::new(directive)
    });

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "Logging already initialized");
    }
}
