//! Per-entity threat scoring with temporary bans.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::clock::{since, SharedClock};
use crate::observability::metrics;
use crate::threat::context::RequestContext;
use crate::threat::profile::{builtin_profiles, ThreatProfile, DEFAULT_PROFILE};
use crate::threat::signals::{default_signals, RequestSample, SignalContext, ThreatSignal};

/// Samples retained per entity.
pub const HISTORY_CAPACITY: usize = 1000;

/// Weight of the newest raw score in the smoothed score.
pub const SMOOTHING_ALPHA: f64 = 0.3;

/// Longest ban the detector will record; longer requests are clamped.
pub const MAX_BAN_DURATION: Duration = Duration::from_secs(365 * 24 * 3600);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreatDetectorSettings {
    /// Entities tracked before least-recently-seen ones are evicted.
    pub max_tracked_entities: usize,
    /// Idle time after which an entity's history is dropped, in seconds.
    pub entity_idle_secs: u64,
}

impl Default for ThreatDetectorSettings {
    fn default() -> Self {
        Self {
            max_tracked_entities: 10_000,
            entity_idle_secs: 3600,
        }
    }
}

/// Result of scoring one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreatAssessment {
    pub entity: String,
    /// Smoothed score in `[0, 1]`.
    pub score: f64,
    /// This request's un-smoothed contribution, capped at 1.0.
    pub raw_score: f64,
    pub reasons: Vec<String>,
    pub violations: u32,
    pub banned: bool,
}

impl ThreatAssessment {
    pub fn is_suspicious(&self, profile: &ThreatProfile) -> bool {
        self.banned || self.score >= profile.suspicion_threshold
    }

    pub fn warrants_ban(&self, profile: &ThreatProfile) -> bool {
        !self.banned && (self.score >= profile.ban_threshold || self.violations >= profile.max_violations)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreatStats {
    pub tracked_entities: usize,
    pub active_bans: usize,
    pub requests_analyzed: u64,
    pub suspicious_requests: u64,
    pub bans_issued: u64,
    pub banned_requests: u64,
    pub profiles: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BanEntry {
    pub entity: String,
    pub remaining_secs: u64,
}

struct EntityRecord {
    history: VecDeque<RequestSample>,
    score: f64,
    violations: u32,
    last_seen: Instant,
}

impl EntityRecord {
    fn new(now: Instant) -> Self {
        Self {
            history: VecDeque::new(),
            score: 0.0,
            violations: 0,
            last_seen: now,
        }
    }
}

pub struct ThreatDetector {
    settings: ThreatDetectorSettings,
    entities: DashMap<String, EntityRecord>,
    bans: DashMap<String, Instant>,
    profiles: RwLock<HashMap<String, ThreatProfile>>,
    signals: Vec<Box<dyn ThreatSignal>>,
    clock: SharedClock,
    analyzed: AtomicU64,
    suspicious: AtomicU64,
    bans_issued: AtomicU64,
    banned_hits: AtomicU64,
}

impl fmt::Debug for ThreatDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreatDetector")
            .field("settings", &self.settings)
            .field("tracked_entities", &self.entities.len())
            .field("signals", &self.signals)
            .finish_non_exhaustive()
    }
}

impl ThreatDetector {
    pub fn new(settings: ThreatDetectorSettings, clock: SharedClock) -> Self {
        Self::with_signals(settings, default_signals(), clock)
    }

    pub fn with_signals(
        settings: ThreatDetectorSettings,
        signals: Vec<Box<dyn ThreatSignal>>,
        clock: SharedClock,
    ) -> Self {
        Self {
            settings,
            entities: DashMap::new(),
            bans: DashMap::new(),
            profiles: RwLock::new(builtin_profiles()),
            signals,
            clock,
            analyzed: AtomicU64::new(0),
            suspicious: AtomicU64::new(0),
            bans_issued: AtomicU64::new(0),
            banned_hits: AtomicU64::new(0),
        }
    }

    /// Add or replace a named profile.
    pub fn add_profile(&self, name: &str, profile: ThreatProfile) {
        self.profiles
            .write()
            .expect("threat profile lock poisoned")
            .insert(name.to_string(), profile);
    }

    /// Named profile, falling back to `default` for unknown names.
    pub fn profile(&self, name: &str) -> ThreatProfile {
        let profiles = self.profiles.read().expect("threat profile lock poisoned");
        if let Some(profile) = profiles.get(name) {
            return profile.clone();
        }
        tracing::warn!(profile = %name, "Unknown threat profile, using default");
        profiles.get(DEFAULT_PROFILE).cloned().unwrap_or_default()
    }

    pub fn profile_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .profiles
            .read()
            .expect("threat profile lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Score `ctx` under `profile_name` and fold it into the entity's state.
    ///
    /// Banned entities short-circuit with a score of 1.0 and leave their
    /// history untouched.
    pub fn analyze_request(&self, ctx: &RequestContext, profile_name: &str) -> ThreatAssessment {
        self.analyze_with_profile(ctx, &self.profile(profile_name))
    }

    /// [`analyze_request`](Self::analyze_request) with an already resolved profile.
    pub fn analyze_with_profile(&self, ctx: &RequestContext, profile: &ThreatProfile) -> ThreatAssessment {
        let now = self.clock.now();
        let entity = ctx.entity_key();
        self.analyzed.fetch_add(1, Ordering::Relaxed);

        if self.is_banned_at(&entity, now) {
            self.banned_hits.fetch_add(1, Ordering::Relaxed);
            let violations = self.entities.get(&entity).map(|r| r.violations).unwrap_or(0);
            return ThreatAssessment {
                entity,
                score: 1.0,
                raw_score: 1.0,
                reasons: vec!["banned".to_string()],
                violations,
                banned: true,
            };
        }

        let is_new = !self.entities.contains_key(&entity);

        let assessment = {
            let mut record = self
                .entities
                .entry(entity.clone())
                .or_insert_with(|| EntityRecord::new(now));
            record.last_seen = now;
            record.history.push_back(RequestSample::from_context(ctx, now));
            while record.history.len() > HISTORY_CAPACITY {
                record.history.pop_front();
            }

            let (raw, reasons) = match record.history.back() {
                Some(current) => self.evaluate_signals(&SignalContext {
                    profile,
                    history: &record.history,
                    current,
                    now,
                }),
                None => (0.0, Vec::new()),
            };
            let raw = raw.min(1.0);

            record.score = (SMOOTHING_ALPHA * raw + (1.0 - SMOOTHING_ALPHA) * record.score).clamp(0.0, 1.0);
            if record.score >= profile.suspicion_threshold {
                record.violations += 1;
            }

            ThreatAssessment {
                entity: entity.clone(),
                score: record.score,
                raw_score: raw,
                reasons,
                violations: record.violations,
                banned: false,
            }
        };

        if assessment.is_suspicious(profile) {
            self.suspicious.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                entity = %entity,
                score = assessment.score,
                reasons = ?assessment.reasons,
                "Suspicious request"
            );
        }

        if is_new && self.entities.len() > self.settings.max_tracked_entities {
            self.cleanup();
        }

        assessment
    }

    fn evaluate_signals(&self, ctx: &SignalContext<'_>) -> (f64, Vec<String>) {
        self.signals
            .iter()
            .filter_map(|signal| signal.evaluate(ctx))
            .fold((0.0, Vec::new()), |(score, mut reasons), hit| {
                reasons.push(hit.reason);
                (score + hit.score, reasons)
            })
    }

    /// Ban `entity` for `duration`, clamped to [`MAX_BAN_DURATION`].
    /// Violations reset so the entity starts clean when the ban lapses.
    pub fn ban_entity(&self, entity: &str, duration: Duration) {
        let duration = duration.min(MAX_BAN_DURATION);
        let now = self.clock.now();
        let Some(until) = now.checked_add(duration) else {
            tracing::error!(entity = %entity, duration_secs = duration.as_secs(), "Ban expiry out of range, ban skipped");
            return;
        };
        self.bans.insert(entity.to_string(), until);
        if let Some(mut record) = self.entities.get_mut(entity) {
            record.violations = 0;
        }
        self.bans_issued.fetch_add(1, Ordering::Relaxed);
        metrics::record_ban();
        tracing::warn!(entity = %entity, duration_secs = duration.as_secs(), "Entity banned");
    }

    /// Lift a ban early. Returns whether one was active.
    pub fn unban_entity(&self, entity: &str) -> bool {
        let removed = self.bans.remove(entity).is_some();
        if removed {
            tracing::info!(entity = %entity, "Entity unbanned");
        }
        removed
    }

    pub fn is_banned(&self, entity: &str) -> bool {
        self.is_banned_at(entity, self.clock.now())
    }

    fn is_banned_at(&self, entity: &str, now: Instant) -> bool {
        let active = match self.bans.get(entity) {
            Some(until) => now < *until,
            None => return false,
        };
        if !active {
            self.bans.remove_if(entity, |_, until| now >= *until);
        }
        active
    }

    pub fn ban_remaining(&self, entity: &str) -> Option<Duration> {
        let now = self.clock.now();
        self.bans
            .get(entity)
            .map(|until| until.saturating_duration_since(now))
            .filter(|remaining| !remaining.is_zero())
    }

    pub fn active_bans(&self) -> Vec<BanEntry> {
        let now = self.clock.now();
        let mut bans: Vec<BanEntry> = self
            .bans
            .iter()
            .filter(|e| now < *e.value())
            .map(|e| BanEntry {
                entity: e.key().clone(),
                remaining_secs: e.value().saturating_duration_since(now).as_secs(),
            })
            .collect();
        bans.sort_by(|a, b| a.entity.cmp(&b.entity));
        bans
    }

    /// Current smoothed score for `entity`, if tracked.
    pub fn entity_score(&self, entity: &str) -> Option<f64> {
        self.entities.get(entity).map(|r| r.score)
    }

    pub fn violations(&self, entity: &str) -> u32 {
        self.entities.get(entity).map(|r| r.violations).unwrap_or(0)
    }

    pub fn tracked_entities(&self) -> usize {
        self.entities.len()
    }

    /// Drop expired bans and idle entities, then evict down to the cap.
    /// Returns the number of entities removed.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        self.bans.retain(|_, until| now < *until);

        let idle = Duration::from_secs(self.settings.entity_idle_secs);
        let before = self.entities.len();
        self.entities.retain(|key, record| {
            since(now, record.last_seen) <= idle || self.bans.contains_key(key)
        });

        let overflow = self.entities.len().saturating_sub(self.settings.max_tracked_entities);
        if overflow > 0 {
            let mut by_age: Vec<(String, Instant)> = self
                .entities
                .iter()
                .map(|e| (e.key().clone(), e.value().last_seen))
                .collect();
            by_age.sort_by_key(|(_, seen)| *seen);
            for (key, _) in by_age.into_iter().take(overflow) {
                self.entities.remove(&key);
            }
        }

        let removed = before.saturating_sub(self.entities.len());
        if removed > 0 {
            tracing::debug!(removed, remaining = self.entities.len(), "Threat detector cleanup");
        }
        removed
    }

    pub fn stats(&self) -> ThreatStats {
        let now = self.clock.now();
        ThreatStats {
            tracked_entities: self.entities.len(),
            active_bans: self.bans.iter().filter(|e| now < *e.value()).count(),
            requests_analyzed: self.analyzed.load(Ordering::Relaxed),
            suspicious_requests: self.suspicious.load(Ordering::Relaxed),
            bans_issued: self.bans_issued.load(Ordering::Relaxed),
            banned_requests: self.banned_hits.load(Ordering::Relaxed),
            profiles: self.profile_names(),
        }
    }
}
