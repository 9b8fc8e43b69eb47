//! Per-key admission state and the three metering algorithms.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::clock::since;
use crate::rate_limit::config::{Algorithm, RateLimitConfig};

/// Denials tolerated before a key enters its penalty window.
pub(crate) const VIOLATIONS_BEFORE_PENALTY: u32 = 3;

#[derive(Debug)]
enum Meter {
    Bucket {
        tokens: f64,
        last_refill: Instant,
    },
    Window {
        hits: VecDeque<Instant>,
        /// Start of the current aligned window, in seconds since the limiter origin.
        window_start: u64,
    },
}

/// Result of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Outcome {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after: Duration,
    /// This check pushed the key into its penalty window.
    pub penalty_started: bool,
    /// The key was already serving a penalty.
    pub penalized: bool,
}

/// Admission state for one tracking key.
#[derive(Debug)]
pub(crate) struct KeyState {
    algorithm: Algorithm,
    meter: Meter,
    violations: u32,
    penalty_until: Option<Instant>,
    last_seen: Instant,
}

impl KeyState {
    pub fn new(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            algorithm: config.algorithm(),
            meter: Self::fresh_meter(config, now),
            violations: 0,
            penalty_until: None,
            last_seen: now,
        }
    }

    fn fresh_meter(config: &RateLimitConfig, now: Instant) -> Meter {
        match config.algorithm() {
            Algorithm::TokenBucket => Meter::Bucket {
                tokens: config.capacity() as f64,
                last_refill: now,
            },
            Algorithm::SlidingWindow | Algorithm::FixedWindow => Meter::Window {
                hits: VecDeque::new(),
                window_start: 0,
            },
        }
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn violations(&self) -> u32 {
        self.violations
    }

    pub fn penalty_active(&self, now: Instant) -> bool {
        self.penalty_until.is_some_and(|until| now < until)
    }

    /// Run one admission check, mutating the meter.
    pub fn check(&mut self, config: &RateLimitConfig, now: Instant, origin: Instant) -> Outcome {
        self.last_seen = now;

        if let Some(until) = self.penalty_until {
            if now < until {
                return Outcome {
                    allowed: false,
                    remaining: 0,
                    retry_after: since(until, now),
                    penalty_started: false,
                    penalized: true,
                };
            }
            self.penalty_until = None;
            self.violations = 0;
        }

        if self.algorithm != config.algorithm() {
            // Policy changed underneath this key; restart metering.
            self.algorithm = config.algorithm();
            self.meter = Self::fresh_meter(config, now);
        }

        let capacity = config.capacity();
        let allowed = match &mut self.meter {
            Meter::Bucket { tokens, last_refill } => {
                let elapsed = since(now, *last_refill).as_secs_f64();
                *tokens = (*tokens + elapsed * config.refill_rate()).min(capacity as f64);
                *last_refill = now;
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    true
                } else {
                    false
                }
            }
            Meter::Window { hits, window_start } => {
                match config.algorithm() {
                    Algorithm::FixedWindow => {
                        let current = aligned_window_start(now, origin, config.window_seconds());
                        if current != *window_start {
                            hits.clear();
                            *window_start = current;
                        }
                    }
                    _ => prune(hits, now, config.window()),
                }
                if (hits.len() as u64) < capacity as u64 {
                    hits.push_back(now);
                    true
                } else {
                    false
                }
            }
        };

        if allowed {
            return Outcome {
                allowed,
                remaining: self.remaining(config, now, origin),
                retry_after: Duration::ZERO,
                penalty_started: false,
                penalized: false,
            };
        }

        self.violations += 1;
        if self.violations > VIOLATIONS_BEFORE_PENALTY {
            let window = config.penalty_window();
            self.penalty_until = Some(now + window);
            return Outcome {
                allowed: false,
                remaining: 0,
                retry_after: window,
                penalty_started: true,
                penalized: true,
            };
        }

        Outcome {
            allowed: false,
            remaining: 0,
            retry_after: self.reset_after(config, now, origin),
            penalty_started: false,
            penalized: false,
        }
    }

    /// Requests still admissible right now, computed without mutation.
    pub fn remaining(&self, config: &RateLimitConfig, now: Instant, origin: Instant) -> u32 {
        if self.penalty_active(now) {
            return 0;
        }
        if self.algorithm != config.algorithm() {
            return config.capacity();
        }
        let capacity = config.capacity();
        match &self.meter {
            Meter::Bucket { .. } => self.tokens_at(config, now).unwrap_or(0.0).floor() as u32,
            Meter::Window { hits, window_start } => {
                let used = match config.algorithm() {
                    Algorithm::FixedWindow => {
                        if aligned_window_start(now, origin, config.window_seconds()) == *window_start {
                            hits.len()
                        } else {
                            0
                        }
                    }
                    _ => {
                        let cutoff = now.checked_sub(config.window());
                        hits.iter().filter(|t| cutoff.map_or(true, |c| **t > c)).count()
                    }
                };
                capacity.saturating_sub(used as u32)
            }
        }
    }

    /// Token count after a hypothetical refill at `now`. `None` for window meters.
    pub fn tokens_at(&self, config: &RateLimitConfig, now: Instant) -> Option<f64> {
        match &self.meter {
            Meter::Bucket { tokens, last_refill } => {
                let elapsed = since(now, *last_refill).as_secs_f64();
                Some((*tokens + elapsed * config.refill_rate()).min(config.capacity() as f64))
            }
            Meter::Window { .. } => None,
        }
    }

    /// Time until the key can next be admitted.
    pub fn reset_after(&self, config: &RateLimitConfig, now: Instant, origin: Instant) -> Duration {
        if let Some(until) = self.penalty_until {
            if now < until {
                return since(until, now);
            }
        }
        if self.algorithm != config.algorithm() {
            return Duration::ZERO;
        }
        match &self.meter {
            Meter::Bucket { .. } => {
                let tokens = self.tokens_at(config, now).unwrap_or(0.0);
                if tokens >= 1.0 {
                    Duration::ZERO
                } else {
                    Duration::from_secs_f64((1.0 - tokens) / config.refill_rate())
                }
            }
            Meter::Window { hits, window_start } => match config.algorithm() {
                Algorithm::FixedWindow => {
                    let elapsed = since(now, origin);
                    let window_end = Duration::from_secs(window_start + config.window_seconds());
                    window_end.saturating_sub(elapsed)
                }
                _ => {
                    if self.remaining(config, now, origin) > 0 {
                        return Duration::ZERO;
                    }
                    let cutoff = now.checked_sub(config.window());
                    hits.iter()
                        .find(|t| cutoff.map_or(true, |c| **t > c))
                        .map(|oldest| since(*oldest + config.window(), now))
                        .unwrap_or(Duration::ZERO)
                }
            },
        }
    }
}

fn prune(hits: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    let Some(cutoff) = now.checked_sub(window) else {
        return;
    };
    while hits.front().is_some_and(|t| *t <= cutoff) {
        hits.pop_front();
    }
}

/// `floor(elapsed / window) * window`, in whole seconds since `origin`.
fn aligned_window_start(now: Instant, origin: Instant, window_seconds: u64) -> u64 {
    let elapsed = since(now, origin).as_secs();
    (elapsed / window_seconds) * window_seconds
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max: u32, window: u64, algorithm: Algorithm) -> RateLimitConfig {
        RateLimitConfig::new(max, window).unwrap().with_algorithm(algorithm)
    }

    #[test]
    fn token_bucket_never_exceeds_capacity() {
        let cfg = config(5, 10, Algorithm::TokenBucket).with_burst(2);
        let origin = Instant::now();
        let mut state = KeyState::new(&cfg, origin);

        let later = origin + Duration::from_secs(3600);
        assert_eq!(state.tokens_at(&cfg, later), Some(7.0));

        let outcome = state.check(&cfg, later, origin);
        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 6);
    }

    #[test]
    fn fixed_window_resets_on_boundary() {
        let cfg = config(2, 10, Algorithm::FixedWindow);
        let origin = Instant::now();
        let mut state = KeyState::new(&cfg, origin);

        let t = origin + Duration::from_secs(3);
        assert!(state.check(&cfg, t, origin).allowed);
        assert!(state.check(&cfg, t, origin).allowed);
        let denied = state.check(&cfg, t, origin);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_secs(7));

        let next_window = origin + Duration::from_secs(10);
        assert!(state.check(&cfg, next_window, origin).allowed);
    }

    #[test]
    fn sliding_window_retry_after_tracks_oldest_hit() {
        let cfg = config(2, 10, Algorithm::SlidingWindow);
        let origin = Instant::now();
        let mut state = KeyState::new(&cfg, origin);

        assert!(state.check(&cfg, origin, origin).allowed);
        assert!(state.check(&cfg, origin + Duration::from_secs(4), origin).allowed);
        let denied = state.check(&cfg, origin + Duration::from_secs(6), origin);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_secs(4));
    }

    #[test]
    fn fourth_denial_starts_penalty() {
        let cfg = config(1, 10, Algorithm::SlidingWindow);
        let origin = Instant::now();
        let mut state = KeyState::new(&cfg, origin);

        assert!(state.check(&cfg, origin, origin).allowed);
        for _ in 0..VIOLATIONS_BEFORE_PENALTY {
            let outcome = state.check(&cfg, origin, origin);
            assert!(!outcome.allowed);
            assert!(!outcome.penalized);
        }
        let outcome = state.check(&cfg, origin, origin);
        assert!(outcome.penalty_started);
        assert_eq!(outcome.retry_after, cfg.penalty_window());

        // Window has rolled over but the penalty still denies.
        let t = origin + Duration::from_secs(11);
        let outcome = state.check(&cfg, t, origin);
        assert!(!outcome.allowed);
        assert!(outcome.penalized);

        // After the penalty the violation counter starts over.
        let t = origin + cfg.penalty_window() + Duration::from_secs(1);
        assert!(state.check(&cfg, t, origin).allowed);
        assert_eq!(state.violations(), 0);
    }
}
