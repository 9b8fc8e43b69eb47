//! Request admission middleware.

pub mod protection;

pub use protection::{protection_middleware, X_RATELIMIT_REMAINING};
