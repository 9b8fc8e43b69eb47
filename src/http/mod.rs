//! HTTP front end.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, connect info, timeout + trace layers)
//!     → request.rs (peer address and identity headers → RequestContext)
//!     → middleware/ (DoSProtector::protect, breaker feedback)
//!     → response.rs (ProtectionError → status, Retry-After, JSON body)
//!     → Send to client
//! ```

pub mod middleware;
pub mod request;
pub mod response;
pub mod server;

pub use middleware::{protection_middleware, X_RATELIMIT_REMAINING};
pub use request::request_context;
pub use server::{AppState, GuardServer};
