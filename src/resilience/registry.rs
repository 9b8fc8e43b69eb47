//! Named circuit breaker registry.
//!
//! Owned by whoever builds the protector and shared by `Arc`; breakers are
//! created on demand the first time a dependency name is seen.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;

use crate::clock::SharedClock;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, StateCallback};

pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
    callbacks: RwLock<Vec<StateCallback>>,
    clock: SharedClock,
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &self.names())
            .finish_non_exhaustive()
    }
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
            callbacks: RwLock::new(Vec::new()),
            clock,
        }
    }

    /// Existing breaker for `name`, or a new one built from `config` (or the
    /// registry default). The config is ignored when the breaker exists.
    pub fn get_or_create(&self, name: &str, config: Option<CircuitBreakerConfig>) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| self.build(name, config.unwrap_or_else(|| self.default_config.clone())))
            .clone()
    }

    /// Install a breaker for `name`, replacing any existing one whose config
    /// differs. An identical config keeps the running breaker and its state.
    pub fn register(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            if existing.config() == &config {
                return existing.clone();
            }
        }
        let breaker = self.build(name, config);
        self.breakers.insert(name.to_string(), breaker.clone());
        tracing::info!(breaker = %name, "Circuit breaker registered");
        breaker
    }

    fn build(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = CircuitBreaker::new(name, config, self.clock.clone());
        for callback in self.callbacks.read().expect("registry callback lock poisoned").iter() {
            breaker.on_state_change(callback.clone());
        }
        Arc::new(breaker)
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.breakers.contains_key(name)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.remove(name).map(|(_, b)| b)
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Sorted breaker names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Observe transitions on every current and future breaker.
    pub fn on_state_change(&self, callback: StateCallback) {
        for entry in self.breakers.iter() {
            entry.value().on_state_change(callback.clone());
        }
        self.callbacks
            .write()
            .expect("registry callback lock poisoned")
            .push(callback);
    }

    pub fn all_stats(&self) -> BTreeMap<String, CircuitBreakerStats> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }
}
