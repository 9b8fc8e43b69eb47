//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize; policy constructors reject bad values)
//!     → validation.rs (semantic checks, every error reported)
//!     → GuardConfig (validated, immutable)
//!     → DoSProtector::from_config
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → mpsc channel → server swaps the config and re-applies policies
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - A bad revision is logged and dropped; the running config stays

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{AdminConfig, GuardConfig, KindRoute, LimitPolicy, ObservabilityConfig, ResourcesConfig, ServerConfig};
pub use validation::{validate_config, ValidationError};
pub use watcher::ConfigWatcher;
