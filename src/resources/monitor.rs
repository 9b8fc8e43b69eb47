//! Background resource sampling and limit checks.

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::clock::{since, SharedClock};
use crate::error::{ProtectionError, ResourceKind};
use crate::observability::metrics;
use crate::resources::sampler::{ProcessSample, ProcessSampler};

/// Backoff advertised on every resource denial.
pub const RESOURCE_RETRY_AFTER: Duration = Duration::from_secs(60);

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub max_memory_mb: f64,
    pub max_cpu_percent: f64,
    pub max_request_size_mb: f64,
    /// Applied by the async guard to the wrapped future.
    pub request_timeout_seconds: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 1024.0,
            max_cpu_percent: 80.0,
            max_request_size_mb: 10.0,
            request_timeout_seconds: 30.0,
        }
    }
}

impl ResourceLimits {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_seconds.max(0.0))
    }

    /// Compare a process reading against the memory and CPU ceilings.
    pub fn check_process(&self, sample: &ProcessSample) -> Result<(), ProtectionError> {
        if sample.memory_mb > self.max_memory_mb {
            return Err(exhausted(ResourceKind::Memory, sample.memory_mb, self.max_memory_mb));
        }
        if sample.cpu_percent > self.max_cpu_percent {
            return Err(exhausted(ResourceKind::Cpu, sample.cpu_percent, self.max_cpu_percent));
        }
        Ok(())
    }

    pub fn check_request_size(&self, bytes: u64) -> Result<(), ProtectionError> {
        let size_mb = bytes as f64 / (1024.0 * 1024.0);
        if size_mb > self.max_request_size_mb {
            return Err(exhausted(ResourceKind::RequestSize, size_mb, self.max_request_size_mb));
        }
        Ok(())
    }
}

fn exhausted(resource: ResourceKind, current: f64, limit: f64) -> ProtectionError {
    ProtectionError::ResourceExhausted {
        resource,
        current,
        limit,
        retry_after: RESOURCE_RETRY_AFTER,
    }
}

/// Latest reading plus bookkeeping. `sampled_at` is `None` until the first
/// successful sample; an unsampled snapshot never trips a limit.
#[derive(Debug, Clone, Default)]
pub struct ResourceSnapshot {
    pub sample: ProcessSample,
    pub sampled_at: Option<Instant>,
    pub samples: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceStats {
    pub memory_mb: f64,
    pub cpu_percent: f64,
    pub samples: u64,
    pub failures: u64,
    pub last_sample_age_secs: Option<f64>,
    pub running: bool,
    pub limits: ResourceLimits,
}

struct SamplerTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the sampling task and the shared snapshot it writes.
pub struct ResourceMonitor {
    limits: ArcSwap<ResourceLimits>,
    interval: Duration,
    sampler: Arc<Mutex<Box<dyn ProcessSampler>>>,
    snapshot: Arc<RwLock<ResourceSnapshot>>,
    task: Mutex<Option<SamplerTask>>,
    clock: SharedClock,
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("limits", &*self.limits.load())
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl ResourceMonitor {
    pub fn new(
        limits: ResourceLimits,
        interval: Duration,
        sampler: Box<dyn ProcessSampler>,
        clock: SharedClock,
    ) -> Self {
        Self {
            limits: ArcSwap::from_pointee(limits),
            interval,
            sampler: Arc::new(Mutex::new(sampler)),
            snapshot: Arc::new(RwLock::new(ResourceSnapshot::default())),
            task: Mutex::new(None),
            clock,
        }
    }

    pub fn limits(&self) -> Arc<ResourceLimits> {
        self.limits.load_full()
    }

    /// Replace the limits; takes effect on the next check.
    pub fn set_limits(&self, limits: ResourceLimits) {
        self.limits.store(Arc::new(limits));
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the sampling loop on the current tokio runtime. No-op when
    /// already running.
    pub fn start(&self) {
        let mut task = self.task.lock().expect("monitor task mutex poisoned");
        if task.is_some() {
            return;
        }

        let (stop, mut stop_rx) = watch::channel(false);
        let sampler = self.sampler.clone();
        let snapshot = self.snapshot.clone();
        let clock = self.clock.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs_f64(), "Resource monitor starting");
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        take_sample(&sampler, &snapshot, &clock);
                    }
                    _ = stop_rx.changed() => {
                        tracing::info!("Resource monitor received stop signal, exiting loop");
                        break;
                    }
                }
            }
        });

        *task = Some(SamplerTask { stop, handle });
    }

    /// Signal the loop to exit and wait for it.
    pub async fn stop(&self) {
        let task = self.task.lock().expect("monitor task mutex poisoned").take();
        let Some(task) = task else {
            return;
        };
        let _ = task.stop.send(true);
        if let Err(e) = task.handle.await {
            tracing::error!(error = %e, "Resource monitor task failed");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .expect("monitor task mutex poisoned")
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Take one sample synchronously, outside the loop.
    pub fn sample_now(&self) {
        take_sample(&self.sampler, &self.snapshot, &self.clock);
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        self.snapshot.read().expect("resource snapshot lock poisoned").clone()
    }

    /// Check the latest snapshot against the memory and CPU limits.
    pub fn check(&self) -> Result<(), ProtectionError> {
        let snapshot = self.snapshot();
        if snapshot.sampled_at.is_none() {
            return Ok(());
        }
        self.limits.load().check_process(&snapshot.sample).inspect_err(|e| {
            tracing::warn!(error = %e, "Resource limit exceeded");
        })
    }

    pub fn stats(&self) -> ResourceStats {
        let snapshot = self.snapshot();
        let now = self.clock.now();
        ResourceStats {
            memory_mb: snapshot.sample.memory_mb,
            cpu_percent: snapshot.sample.cpu_percent,
            samples: snapshot.samples,
            failures: snapshot.failures,
            last_sample_age_secs: snapshot.sampled_at.map(|at| since(now, at).as_secs_f64()),
            running: self.is_running(),
            limits: self.limits.load().as_ref().clone(),
        }
    }
}

/// A failed sample keeps the previous reading.
fn take_sample(
    sampler: &Mutex<Box<dyn ProcessSampler>>,
    snapshot: &RwLock<ResourceSnapshot>,
    clock: &SharedClock,
) {
    let result = sampler.lock().expect("resource sampler mutex poisoned").sample();
    let mut snapshot = snapshot.write().expect("resource snapshot lock poisoned");
    match result {
        Ok(sample) => {
            snapshot.sample = sample;
            snapshot.sampled_at = Some(clock.now());
            snapshot.samples += 1;
            metrics::record_process_resources(sample.memory_mb, sample.cpu_percent);
        }
        Err(e) => {
            snapshot.failures += 1;
            tracing::warn!(error = %e, failures = snapshot.failures, "Resource sample failed, keeping previous snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::resources::sampler::StaticSampler;

    fn monitor(sampler: StaticSampler, limits: ResourceLimits) -> ResourceMonitor {
        ResourceMonitor::new(limits, Duration::from_millis(10), Box::new(sampler), Arc::new(ManualClock::new()))
    }

    #[test]
    fn unsampled_monitor_allows() {
        let sampler = StaticSampler::new(ProcessSample { memory_mb: 1e6, cpu_percent: 1e3 });
        let monitor = monitor(sampler, ResourceLimits::default());
        assert!(monitor.check().is_ok());
    }

    #[test]
    fn memory_and_cpu_breaches() {
        let sampler = StaticSampler::new(ProcessSample { memory_mb: 2048.0, cpu_percent: 10.0 });
        let monitor = monitor(sampler.clone(), ResourceLimits::default());
        monitor.sample_now();
        match monitor.check() {
            Err(ProtectionError::ResourceExhausted { resource, retry_after, .. }) => {
                assert_eq!(resource, ResourceKind::Memory);
                assert_eq!(retry_after, RESOURCE_RETRY_AFTER);
            }
            other => panic!("expected memory breach, got {:?}", other),
        }

        sampler.set(ProcessSample { memory_mb: 10.0, cpu_percent: 95.0 });
        monitor.sample_now();
        assert!(matches!(
            monitor.check(),
            Err(ProtectionError::ResourceExhausted { resource: ResourceKind::Cpu, .. })
        ));
    }

    #[test]
    fn failed_sample_keeps_previous_snapshot() {
        let sampler = StaticSampler::new(ProcessSample { memory_mb: 100.0, cpu_percent: 5.0 });
        let monitor = monitor(sampler.clone(), ResourceLimits::default());
        monitor.sample_now();
        sampler.fail("no procfs");
        monitor.sample_now();

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.sample.memory_mb, 100.0);
        assert_eq!(snapshot.samples, 1);
        assert_eq!(snapshot.failures, 1);
        assert!(monitor.check().is_ok());
    }

    #[test]
    fn request_size_limit() {
        let limits = ResourceLimits { max_request_size_mb: 1.0, ..Default::default() };
        assert!(limits.check_request_size(1024 * 1024).is_ok());
        assert!(matches!(
            limits.check_request_size(1024 * 1024 + 1),
            Err(ProtectionError::ResourceExhausted { resource: ResourceKind::RequestSize, .. })
        ));
    }

    #[tokio::test]
    async fn loop_samples_until_stopped() {
        let sampler = StaticSampler::new(ProcessSample { memory_mb: 64.0, cpu_percent: 1.0 });
        let monitor = monitor(sampler, ResourceLimits::default());
        monitor.start();
        monitor.start();
        assert!(monitor.is_running());

        time::sleep(Duration::from_millis(50)).await;
        monitor.stop().await;
        assert!(!monitor.is_running());

        let taken = monitor.snapshot().samples;
        assert!(taken >= 1);
        time::sleep(Duration::from_millis(30)).await;
        assert_eq!(monitor.snapshot().samples, taken);
    }
}
