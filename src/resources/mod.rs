//! Process resource pressure.
//!
//! # Data Flow
//! ```text
//! monitor.rs loop (every interval, until stopped):
//!     → sampler.rs (memory / CPU of this process)
//!     → shared snapshot (last good reading wins)
//!
//! DoSProtector::protect:
//!     → monitor.check() against ResourceLimits
//! ```

pub mod monitor;
pub mod sampler;

pub use monitor::{
    ResourceLimits, ResourceMonitor, ResourceSnapshot, ResourceStats, DEFAULT_SAMPLE_INTERVAL, RESOURCE_RETRY_AFTER,
};
pub use sampler::{ProcessSample, ProcessSampler, SampleError, StaticSampler, SysinfoSampler};
