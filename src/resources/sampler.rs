//! Process introspection.

use std::fmt;
use std::sync::{Arc, Mutex};

use sysinfo::{Pid, ProcessesToUpdate, System};
use thiserror::Error;

/// One reading of the current process.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProcessSample {
    /// Resident memory in MiB.
    pub memory_mb: f64,
    /// CPU usage; 100.0 is one fully busy core.
    pub cpu_percent: f64,
}

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("cannot determine current process id: {0}")]
    Pid(String),

    #[error("process {0} not found")]
    ProcessMissing(u32),

    #[error("sampler unavailable: {0}")]
    Unavailable(String),
}

/// Source of process readings for the resource monitor.
pub trait ProcessSampler: Send + fmt::Debug {
    fn sample(&mut self) -> Result<ProcessSample, SampleError>;
}

/// Reads the current process through `sysinfo`.
///
/// CPU usage is a delta between refreshes, so the first reading after
/// construction reports 0.
pub struct SysinfoSampler {
    system: System,
    pid: Pid,
}

impl SysinfoSampler {
    pub fn new() -> Result<Self, SampleError> {
        let pid = sysinfo::get_current_pid().map_err(|e| SampleError::Pid(e.to_string()))?;
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        Ok(Self { system, pid })
    }
}

impl fmt::Debug for SysinfoSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SysinfoSampler").field("pid", &self.pid.as_u32()).finish()
    }
}

impl ProcessSampler for SysinfoSampler {
    fn sample(&mut self) -> Result<ProcessSample, SampleError> {
        self.system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        let process = self
            .system
            .process(self.pid)
            .ok_or(SampleError::ProcessMissing(self.pid.as_u32()))?;
        Ok(ProcessSample {
            memory_mb: process.memory() as f64 / 1024.0 / 1024.0,
            cpu_percent: f64::from(process.cpu_usage()),
        })
    }
}

/// Fixed readings, swappable at runtime. Useful for tests and for hosts
/// where process introspection is not permitted.
#[derive(Debug, Clone)]
pub struct StaticSampler {
    reading: Arc<Mutex<Result<ProcessSample, String>>>,
}

impl StaticSampler {
    pub fn new(sample: ProcessSample) -> Self {
        Self {
            reading: Arc::new(Mutex::new(Ok(sample))),
        }
    }

    pub fn set(&self, sample: ProcessSample) {
        *self.reading.lock().expect("static sampler mutex poisoned") = Ok(sample);
    }

    /// Make subsequent samples fail with `reason`.
    pub fn fail(&self, reason: impl Into<String>) {
        *self.reading.lock().expect("static sampler mutex poisoned") = Err(reason.into());
    }
}

impl Default for StaticSampler {
    fn default() -> Self {
        Self::new(ProcessSample::default())
    }
}

impl ProcessSampler for StaticSampler {
    fn sample(&mut self) -> Result<ProcessSample, SampleError> {
        self.reading
            .lock()
            .expect("static sampler mutex poisoned")
            .clone()
            .map_err(SampleError::Unavailable)
    }
}
