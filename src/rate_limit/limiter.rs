//! Keyed rate limiter with policy lookup and bounded-memory cleanup.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use crate::clock::{since, SharedClock};
use crate::error::ProtectionError;
use crate::observability::metrics;
use crate::rate_limit::config::{RateLimitConfig, RateLimiterSettings};
use crate::rate_limit::state::{KeyState, Outcome};

/// Identity a quota is tracked against.
///
/// Precedence when building the entity key: explicit entity id, then user id,
/// then IP address, then the shared `global` bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Subject {
    pub entity_id: Option<String>,
    pub user_id: Option<String>,
    pub ip: Option<IpAddr>,
}

impl Subject {
    /// One bucket shared by every caller.
    pub fn global() -> Self {
        Self::default()
    }

    pub fn entity(id: impl Into<String>) -> Self {
        Self {
            entity_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            user_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn ip(addr: IpAddr) -> Self {
        Self {
            ip: Some(addr),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    pub fn with_ip(mut self, addr: IpAddr) -> Self {
        self.ip = Some(addr);
        self
    }

    /// Entity part of the tracking key.
    pub fn entity_key(&self) -> String {
        if let Some(id) = &self.entity_id {
            id.clone()
        } else if let Some(user) = &self.user_id {
            format!("user:{}", user)
        } else if let Some(ip) = &self.ip {
            format!("ip:{}", ip)
        } else {
            "global".to_string()
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.entity_key())
    }
}

/// A successful admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub key: String,
    pub remaining: u32,
    pub limit: u32,
}

/// Read-only limiter counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RateLimiterStats {
    pub tracked_keys: usize,
    pub total_checks: u64,
    pub allowed: u64,
    pub denied: u64,
    pub penalties_applied: u64,
    pub evicted_keys: u64,
    pub configured_policies: usize,
}

#[derive(Debug, Clone)]
struct LimitPolicy {
    pattern: Option<String>,
    config: RateLimitConfig,
}

#[derive(Debug, Default)]
struct Counters {
    checks: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    penalties: AtomicU64,
    evictions: AtomicU64,
}

/// Per-key admission control.
///
/// Key state lives in a sharded map; a check holds only the shard lock of its
/// own key, so checks for one key are serialized while different keys proceed
/// concurrently.
#[derive(Debug)]
pub struct RateLimiter {
    states: DashMap<String, KeyState>,
    policies: RwLock<HashMap<String, Vec<LimitPolicy>>>,
    settings: RateLimiterSettings,
    last_cleanup: Mutex<Instant>,
    origin: Instant,
    clock: SharedClock,
    counters: Counters,
}

impl RateLimiter {
    pub fn new(settings: RateLimiterSettings, clock: SharedClock) -> Self {
        let origin = clock.now();
        Self {
            states: DashMap::new(),
            policies: RwLock::new(HashMap::new()),
            settings,
            last_cleanup: Mutex::new(origin),
            origin,
            clock,
            counters: Counters::default(),
        }
    }

    pub fn settings(&self) -> &RateLimiterSettings {
        &self.settings
    }

    /// Register a policy for `kind`, optionally scoped to entities matching a
    /// `*` glob such as `ip:10.*` or `user:bot-*`.
    ///
    /// Registering the same `(kind, pattern)` pair again replaces the policy.
    pub fn configure_limit(&self, kind: &str, config: RateLimitConfig, entity_pattern: Option<&str>) {
        let mut policies = self.policies.write().expect("rate limiter policy lock poisoned");
        let entries = policies.entry(kind.to_string()).or_default();
        let pattern = entity_pattern.map(str::to_string);
        match entries.iter_mut().find(|p| p.pattern == pattern) {
            Some(existing) => existing.config = config.clone(),
            None => entries.push(LimitPolicy {
                pattern,
                config: config.clone(),
            }),
        }
        tracing::info!(
            kind = %kind,
            pattern = ?entity_pattern,
            max_requests = config.max_requests(),
            window_seconds = config.window_seconds(),
            algorithm = %config.algorithm(),
            "Rate limit policy configured"
        );
    }

    /// Swap the whole policy set for `kind` in one step. An empty set removes
    /// the kind so lookups fall back to the default limit.
    pub fn replace_limits<'a>(
        &self,
        kind: &str,
        policies: impl IntoIterator<Item = (RateLimitConfig, Option<&'a str>)>,
    ) {
        let mut entries: Vec<LimitPolicy> = Vec::new();
        for (config, pattern) in policies {
            let pattern = pattern.map(str::to_string);
            entries.retain(|p| p.pattern != pattern);
            entries.push(LimitPolicy { pattern, config });
        }
        let count = entries.len();
        let mut policies = self.policies.write().expect("rate limiter policy lock poisoned");
        if entries.is_empty() {
            policies.remove(kind);
        } else {
            policies.insert(kind.to_string(), entries);
        }
        tracing::info!(kind = %kind, policies = count, "Rate limit policies replaced");
    }

    /// Drop every policy registered for `kind`.
    pub fn remove_limits(&self, kind: &str) -> bool {
        let mut policies = self.policies.write().expect("rate limiter policy lock poisoned");
        policies.remove(kind).is_some()
    }

    /// Resolve the policy for an entity under `kind`.
    pub fn policy_for(&self, kind: &str, entity: &str) -> RateLimitConfig {
        let policies = self.policies.read().expect("rate limiter policy lock poisoned");
        let Some(entries) = policies.get(kind) else {
            return self.settings.default_limit.clone();
        };
        entries
            .iter()
            .find(|p| p.pattern.as_deref().is_some_and(|pat| glob_match(pat, entity)))
            .or_else(|| entries.iter().find(|p| p.pattern.is_none()))
            .map(|p| p.config.clone())
            .unwrap_or_else(|| self.settings.default_limit.clone())
    }

    /// Check and, if admitted, consume one unit of quota.
    pub fn check_limit(&self, kind: &str, subject: &Subject, config: Option<&RateLimitConfig>) -> bool {
        self.evaluate(kind, subject, config).1.allowed
    }

    /// Like [`check_limit`](Self::check_limit) but returns a typed denial.
    pub fn try_acquire(
        &self,
        kind: &str,
        subject: &Subject,
        config: Option<&RateLimitConfig>,
    ) -> Result<Admission, ProtectionError> {
        let (key, outcome, config) = self.evaluate(kind, subject, config);
        if outcome.allowed {
            Ok(Admission {
                key,
                remaining: outcome.remaining,
                limit: config.capacity(),
            })
        } else {
            Err(ProtectionError::RateLimited {
                key,
                limit: config.max_requests(),
                window: config.window(),
                retry_after: outcome.retry_after,
            })
        }
    }

    fn evaluate(
        &self,
        kind: &str,
        subject: &Subject,
        config: Option<&RateLimitConfig>,
    ) -> (String, Outcome, RateLimitConfig) {
        let now = self.clock.now();
        let entity = subject.entity_key();
        let key = tracking_key(kind, &entity);
        let config = match config {
            Some(c) => c.clone(),
            None => self.policy_for(kind, &entity),
        };

        let outcome = {
            let mut state = self
                .states
                .entry(key.clone())
                .or_insert_with(|| KeyState::new(&config, now));
            state.check(&config, now, self.origin)
        };

        self.counters.checks.fetch_add(1, Ordering::Relaxed);
        if outcome.allowed {
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.denied.fetch_add(1, Ordering::Relaxed);
            metrics::record_rate_limited(kind);
            if outcome.penalty_started {
                self.counters.penalties.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    key = %key,
                    penalty_secs = outcome.retry_after.as_secs_f64(),
                    "Repeated rate limit violations, penalty window applied"
                );
            } else {
                tracing::debug!(
                    key = %key,
                    penalized = outcome.penalized,
                    retry_after_secs = outcome.retry_after.as_secs_f64(),
                    "Rate limit exceeded"
                );
            }
        }

        self.maybe_cleanup(now);
        (key, outcome, config)
    }

    /// Remaining quota for a subject, without consuming any.
    pub fn get_remaining_requests(&self, kind: &str, subject: &Subject, config: Option<&RateLimitConfig>) -> u32 {
        let now = self.clock.now();
        let entity = subject.entity_key();
        let config = match config {
            Some(c) => c.clone(),
            None => self.policy_for(kind, &entity),
        };
        match self.states.get(&tracking_key(kind, &entity)) {
            Some(state) => state.remaining(&config, now, self.origin),
            None => config.capacity(),
        }
    }

    /// Time until the subject can next be admitted, without consuming quota.
    pub fn retry_after(&self, kind: &str, subject: &Subject, config: Option<&RateLimitConfig>) -> Duration {
        let now = self.clock.now();
        let entity = subject.entity_key();
        let config = match config {
            Some(c) => c.clone(),
            None => self.policy_for(kind, &entity),
        };
        self.states
            .get(&tracking_key(kind, &entity))
            .map(|state| state.reset_after(&config, now, self.origin))
            .unwrap_or(Duration::ZERO)
    }

    /// Current token count for a token-bucket key, after refill.
    pub fn available_tokens(&self, kind: &str, subject: &Subject, config: Option<&RateLimitConfig>) -> Option<f64> {
        let now = self.clock.now();
        let entity = subject.entity_key();
        let config = match config {
            Some(c) => c.clone(),
            None => self.policy_for(kind, &entity),
        };
        self.states
            .get(&tracking_key(kind, &entity))
            .and_then(|state| state.tokens_at(&config, now))
    }

    /// Forget all state for one key. Calling it twice is the same as once.
    pub fn reset(&self, kind: &str, subject: &Subject) {
        let key = tracking_key(kind, &subject.entity_key());
        if self.states.remove(&key).is_some() {
            tracing::debug!(key = %key, "Rate limit state reset");
        }
    }

    pub fn reset_all(&self) {
        self.states.clear();
        metrics::record_tracked_keys(0);
    }

    pub fn tracked_keys(&self) -> usize {
        self.states.len()
    }

    fn maybe_cleanup(&self, now: Instant) {
        {
            let mut last = self.last_cleanup.lock().expect("rate limiter cleanup mutex poisoned");
            if since(now, *last) < self.settings.cleanup_interval() {
                return;
            }
            *last = now;
        }
        self.cleanup_at(now);
    }

    /// Run a cleanup pass immediately. Returns the number of evicted keys.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        *self.last_cleanup.lock().expect("rate limiter cleanup mutex poisoned") = now;
        self.cleanup_at(now)
    }

    fn cleanup_at(&self, now: Instant) -> usize {
        let before = self.states.len();
        let idle_limit = self.settings.cleanup_interval() * 2;

        self.states
            .retain(|_, state| state.penalty_active(now) || since(now, state.last_seen()) <= idle_limit);

        let cap = self.settings.max_memory_entries;
        if self.states.len() > cap {
            let mut by_age: Vec<(String, Instant)> = self
                .states
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().last_seen()))
                .collect();
            by_age.sort_by_key(|(_, seen)| *seen);
            let excess = by_age.len().saturating_sub(cap);
            for (key, _) in by_age.into_iter().take(excess) {
                self.states.remove(&key);
            }
        }

        let after = self.states.len();
        let evicted = before.saturating_sub(after);
        if evicted > 0 {
            self.counters.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            tracing::debug!(evicted, remaining = after, "Rate limiter cleanup");
        }
        metrics::record_tracked_keys(after);
        evicted
    }

    pub fn stats(&self) -> RateLimiterStats {
        let configured_policies = self
            .policies
            .read()
            .expect("rate limiter policy lock poisoned")
            .values()
            .map(Vec::len)
            .sum();
        RateLimiterStats {
            tracked_keys: self.states.len(),
            total_checks: self.counters.checks.load(Ordering::Relaxed),
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
            penalties_applied: self.counters.penalties.load(Ordering::Relaxed),
            evicted_keys: self.counters.evictions.load(Ordering::Relaxed),
            configured_policies,
        }
    }
}

fn tracking_key(kind: &str, entity: &str) -> String {
    format!("{}:{}", kind, entity)
}

/// Glob match supporting `*` as "any run of characters".
fn glob_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<usize> = None;
    let mut resume = 0;

    while ti < t.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            pi += 1;
            resume = ti;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            resume += 1;
            ti = resume;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}
