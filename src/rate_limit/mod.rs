//! Rate limiting subsystem.
//!
//! # Data Flow
//! ```text
//! check_limit(kind, subject)
//!     → limiter.rs (resolve policy, build "<kind>:<entity>" key)
//!     → state.rs (penalty short-circuit, then token bucket /
//!                 sliding window / fixed window metering)
//!     → admit or deny (+ retry_after from the algorithm's reset time)
//!     → periodic cleanup (idle eviction, then LRU down to the cap)
//! ```
//!
//! # Design Decisions
//! - Key state is sharded; a check only locks its own key's shard
//! - A key that keeps getting denied is penalized for a whole multiple of its window
//! - Memory is bounded by `max_memory_entries` after every cleanup pass

pub mod config;
pub mod limiter;
mod state;

pub use config::{builtin_policies, Algorithm, RateLimitConfig, RateLimiterSettings};
pub use limiter::{Admission, RateLimiter, RateLimiterStats, Subject};
