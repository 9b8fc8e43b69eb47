//! Circuit breaker for dependency protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: dependency assumed down, calls fail fast
//! - Half-Open: probing whether the dependency recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= threshold, or failure / slow-call rate
//!                over the last `min_requests` calls reaches its threshold
//! Open → Half-Open: first permission check after next_attempt_time
//! Half-Open → Closed: success_threshold successes
//! Half-Open → Open: any failure
//! ```
//!
//! # Design Decisions
//! - Per-dependency breaker, one mutex per instance
//! - Open timeout grows exponentially with the failure count
//! - Transition callbacks run after the lock is released; a panicking callback is logged and ignored
//! - `failure_count` survives the Half-Open → Closed transition and is cleared by
//!   the first successful call in Closed, so a dependency that fails again right
//!   after recovering trips immediately with a longer timeout

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::clock::{since, SharedClock};
use crate::error::ProtectionError;
use crate::observability::metrics;
use crate::resilience::backoff::calculate_backoff;

/// Capacity of the per-breaker call history.
pub const HISTORY_CAPACITY: usize = 1000;

/// Breaker thresholds. Durations are expressed in (fractional) seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures that trip a closed breaker.
    pub failure_threshold: u32,

    /// Successes in half-open required to close.
    pub success_threshold: u32,

    /// Base open-state timeout.
    pub timeout_seconds: f64,

    /// Failure ratio over the trailing `min_requests` calls that trips the breaker.
    pub failure_rate_threshold: f64,

    /// Calls required before rate-based tripping is considered.
    pub min_requests: u32,

    /// A call slower than this counts as slow.
    pub slow_call_threshold: f64,

    /// Slow-call ratio over the trailing `min_requests` calls that trips the breaker.
    pub slow_call_rate_threshold: f64,

    /// Upper bound on the open-state timeout.
    pub max_wait_time: f64,

    /// Double the timeout for each accumulated failure.
    pub exponential_backoff: bool,
}

/// Longest open period a breaker will schedule; larger timeouts are clamped.
pub const MAX_OPEN_DURATION: Duration = Duration::from_secs(365 * 24 * 3600);

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        seconds(self.timeout_seconds).min(MAX_OPEN_DURATION)
    }

    pub fn slow_call_duration(&self) -> Duration {
        seconds(self.slow_call_threshold)
    }

    pub fn max_wait(&self) -> Duration {
        seconds(self.max_wait_time).min(MAX_OPEN_DURATION)
    }
}

/// Negative and NaN become zero, out-of-range values saturate.
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

fn open_until(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .or_else(|| now.checked_add(MAX_OPEN_DURATION))
        .unwrap_or(now)
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout_seconds: 60.0,
            failure_rate_threshold: 0.5,
            min_requests: 10,
            slow_call_threshold: 5.0,
            slow_call_rate_threshold: 0.5,
            max_wait_time: 300.0,
            exponential_backoff: true,
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// One executed call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub timestamp: Instant,
    pub duration: Duration,
    pub success: bool,
    pub error_kind: Option<String>,
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    /// The breaker refused the call; the wrapped function never ran.
    #[error(transparent)]
    Rejected(ProtectionError),

    /// The wrapped function ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> CallError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CallError::Rejected(_))
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            CallError::Inner(e) => Some(e),
            CallError::Rejected(_) => None,
        }
    }
}

/// Transition observer: `(breaker name, old state, new state)`.
pub type StateCallback = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Point-in-time breaker statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
    pub state_changes: u64,
    pub failure_rate: f64,
    pub slow_call_rate: f64,
    pub history_len: usize,
    /// Seconds until an open breaker admits a trial call.
    pub retry_after_secs: Option<f64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    next_attempt: Option<Instant>,
    history: VecDeque<CallRecord>,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    rejected_calls: u64,
    state_changes: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            next_attempt: None,
            history: VecDeque::with_capacity(64),
            total_calls: 0,
            total_successes: 0,
            total_failures: 0,
            rejected_calls: 0,
            state_changes: 0,
        }
    }

    fn push(&mut self, record: CallRecord) {
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(record);
        self.total_calls += 1;
    }

    /// Failure and slow-call ratios over the last `window` records.
    fn rates(&self, window: usize, slow: Duration) -> (f64, f64) {
        let take = window.min(self.history.len());
        if take == 0 {
            return (0.0, 0.0);
        }
        let (failures, slow_calls) = self
            .history
            .iter()
            .rev()
            .take(take)
            .fold((0usize, 0usize), |(f, s), r| {
                (f + usize::from(!r.success), s + usize::from(r.duration > slow))
            });
        (failures as f64 / take as f64, slow_calls as f64 / take as f64)
    }

    fn set_state(&mut self, to: CircuitState) -> Option<(CircuitState, CircuitState)> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        self.state_changes += 1;
        Some((from, to))
    }
}

/// A named circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    callbacks: RwLock<Vec<StateCallback>>,
    clock: SharedClock,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::new()),
            callbacks: RwLock::new(Vec::new()),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("circuit breaker mutex poisoned")
    }

    /// Current state, without the Open → Half-Open side effect.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Instant at which an open breaker admits its next trial call.
    pub fn next_attempt_time(&self) -> Option<Instant> {
        self.lock().next_attempt
    }

    /// Register a transition observer.
    pub fn on_state_change(&self, callback: StateCallback) {
        self.callbacks
            .write()
            .expect("circuit breaker callback lock poisoned")
            .push(callback);
    }

    /// Whether a call may proceed right now.
    ///
    /// An open breaker whose timeout has elapsed moves to half-open here.
    pub fn can_execute(&self) -> bool {
        let now = self.clock.now();
        let (allowed, transition) = {
            let mut inner = self.lock();
            match inner.state {
                CircuitState::Closed | CircuitState::HalfOpen => (true, None),
                CircuitState::Open => {
                    if inner.next_attempt.map_or(true, |at| now >= at) {
                        inner.success_count = 0;
                        (true, inner.set_state(CircuitState::HalfOpen))
                    } else {
                        (false, None)
                    }
                }
            }
        };
        self.notify(transition);
        allowed
    }

    /// Permission check returning a typed denial. Rejections are counted.
    pub fn check(&self) -> Result<(), ProtectionError> {
        if self.can_execute() {
            return Ok(());
        }
        let retry_after = {
            let mut inner = self.lock();
            inner.rejected_calls += 1;
            let now = self.clock.now();
            inner.next_attempt.map(|at| since(at, now)).unwrap_or(Duration::ZERO)
        };
        tracing::debug!(breaker = %self.name, retry_after_secs = retry_after.as_secs_f64(), "Circuit open, call rejected");
        Err(ProtectionError::CircuitOpen {
            name: self.name.clone(),
            retry_after,
        })
    }

    /// Time until an open breaker admits a trial call; zero otherwise.
    pub fn retry_after(&self) -> Duration {
        let inner = self.lock();
        match (inner.state, inner.next_attempt) {
            (CircuitState::Open, Some(at)) => since(at, self.clock.now()),
            _ => Duration::ZERO,
        }
    }

    /// Record a successful call.
    pub fn record_success(&self, duration: Duration) {
        let now = self.clock.now();
        let transition = {
            let mut inner = self.lock();
            inner.push(CallRecord {
                timestamp: now,
                duration,
                success: true,
                error_kind: None,
            });
            inner.total_successes += 1;
            match inner.state {
                CircuitState::HalfOpen => {
                    inner.success_count += 1;
                    if inner.success_count >= self.config.success_threshold {
                        inner.success_count = 0;
                        inner.next_attempt = None;
                        inner.set_state(CircuitState::Closed)
                    } else {
                        None
                    }
                }
                CircuitState::Closed => {
                    inner.failure_count = 0;
                    None
                }
                CircuitState::Open => None,
            }
        };
        self.notify(transition);
    }

    /// Record a failed call.
    pub fn record_failure(&self, duration: Duration, error_kind: &str) {
        let now = self.clock.now();
        let transition = {
            let mut inner = self.lock();
            inner.push(CallRecord {
                timestamp: now,
                duration,
                success: false,
                error_kind: Some(error_kind.to_string()),
            });
            inner.total_failures += 1;
            inner.failure_count = inner.failure_count.saturating_add(1);
            match inner.state {
                CircuitState::HalfOpen => self.trip(&mut inner, now),
                CircuitState::Closed if self.should_trip(&inner) => self.trip(&mut inner, now),
                _ => None,
            }
        };
        self.notify(transition);
    }

    fn should_trip(&self, inner: &Inner) -> bool {
        if inner.failure_count >= self.config.failure_threshold {
            return true;
        }
        let window = self.config.min_requests as usize;
        if window == 0 || inner.history.len() < window {
            return false;
        }
        let (failure_rate, slow_rate) = inner.rates(window, self.config.slow_call_duration());
        failure_rate >= self.config.failure_rate_threshold || slow_rate >= self.config.slow_call_rate_threshold
    }

    fn trip(&self, inner: &mut Inner, now: Instant) -> Option<(CircuitState, CircuitState)> {
        let timeout = calculate_backoff(
            inner.failure_count,
            self.config.timeout(),
            self.config.max_wait(),
            self.config.exponential_backoff,
        );
        inner.next_attempt = Some(open_until(now, timeout));
        inner.success_count = 0;
        tracing::warn!(
            breaker = %self.name,
            failure_count = inner.failure_count,
            timeout_secs = timeout.as_secs_f64(),
            "Circuit breaker tripped"
        );
        inner.set_state(CircuitState::Open)
    }

    /// Run `f` under the breaker.
    ///
    /// A panic inside `f` is recorded as a failure before it unwinds further.
    pub fn call<T, E, F>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let guard = self.enter().map_err(CallError::Rejected)?;
        match f() {
            Ok(value) => {
                guard.success();
                Ok(value)
            }
            Err(err) => {
                guard.failure(short_type_name::<E>());
                Err(CallError::Inner(err))
            }
        }
    }

    /// Await `fut` under the breaker. A cancelled future counts as a failure.
    pub async fn call_async<T, E, Fut>(&self, fut: Fut) -> Result<T, CallError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let guard = self.enter().map_err(CallError::Rejected)?;
        match fut.await {
            Ok(value) => {
                guard.success();
                Ok(value)
            }
            Err(err) => {
                guard.failure(short_type_name::<E>());
                Err(CallError::Inner(err))
            }
        }
    }

    /// Scope-guard form: checks permission, records nothing until the guard
    /// is resolved or dropped.
    pub fn enter(&self) -> Result<CallGuard<'_>, ProtectionError> {
        self.check()?;
        Ok(self.track())
    }

    /// Start timing a call that was already admitted through [`check`](Self::check).
    pub fn track(&self) -> CallGuard<'_> {
        CallGuard {
            breaker: self,
            started: self.clock.now(),
            resolved: false,
        }
    }

    /// Open the breaker regardless of history.
    pub fn force_open(&self) {
        let now = self.clock.now();
        let transition = {
            let mut inner = self.lock();
            inner.next_attempt = Some(open_until(now, self.config.timeout()));
            inner.success_count = 0;
            inner.set_state(CircuitState::Open)
        };
        tracing::warn!(breaker = %self.name, "Circuit breaker forced open");
        self.notify(transition);
    }

    /// Close the breaker and clear its counters, keeping history.
    pub fn force_closed(&self) {
        let transition = {
            let mut inner = self.lock();
            inner.failure_count = 0;
            inner.success_count = 0;
            inner.next_attempt = None;
            inner.set_state(CircuitState::Closed)
        };
        tracing::info!(breaker = %self.name, "Circuit breaker forced closed");
        self.notify(transition);
    }

    /// Return to a pristine closed state: counters, totals and history cleared.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.lock();
            let transition = inner.set_state(CircuitState::Closed);
            *inner = Inner::new();
            transition
        };
        self.notify(transition);
    }

    /// Copy of the most recent `limit` call records, oldest first.
    pub fn recent_calls(&self, limit: usize) -> Vec<CallRecord> {
        let inner = self.lock();
        let skip = inner.history.len().saturating_sub(limit);
        inner.history.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let now = self.clock.now();
        let inner = self.lock();
        let (failure_rate, slow_call_rate) = inner.rates(inner.history.len(), self.config.slow_call_duration());
        let retry_after_secs = match (inner.state, inner.next_attempt) {
            (CircuitState::Open, Some(at)) => Some(since(at, now).as_secs_f64()),
            _ => None,
        };
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_calls: inner.total_calls,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            rejected_calls: inner.rejected_calls,
            state_changes: inner.state_changes,
            failure_rate,
            slow_call_rate,
            history_len: inner.history.len(),
            retry_after_secs,
        }
    }

    fn notify(&self, transition: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = transition else {
            return;
        };
        match to {
            CircuitState::Open => tracing::warn!(breaker = %self.name, from = %from, to = %to, "Circuit state changed"),
            _ => tracing::info!(breaker = %self.name, from = %from, to = %to, "Circuit state changed"),
        }
        metrics::record_circuit_state(&self.name, to);

        let callbacks = self
            .callbacks
            .read()
            .expect("circuit breaker callback lock poisoned")
            .clone();
        for callback in callbacks {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&self.name, from, to)));
            if outcome.is_err() {
                tracing::error!(breaker = %self.name, from = %from, to = %to, "State change callback panicked");
            }
        }
    }
}

/// Outstanding call admitted by [`CircuitBreaker::enter`].
///
/// Dropping the guard without resolving it records a failure.
#[must_use = "an unresolved guard records a failure when dropped"]
pub struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    started: Instant,
    resolved: bool,
}

impl CallGuard<'_> {
    pub fn success(mut self) {
        self.resolved = true;
        let elapsed = since(self.breaker.clock.now(), self.started);
        self.breaker.record_success(elapsed);
    }

    pub fn failure(mut self, error_kind: &str) {
        self.resolved = true;
        let elapsed = since(self.breaker.clock.now(), self.started);
        self.breaker.record_failure(elapsed, error_kind);
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let kind = if std::thread::panicking() { "panic" } else { "abandoned" };
        let elapsed = since(self.breaker.clock.now(), self.started);
        self.breaker.record_failure(elapsed, kind);
    }
}

pub(crate) fn short_type_name<E>() -> &'static str {
    let full = std::any::type_name::<E>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
