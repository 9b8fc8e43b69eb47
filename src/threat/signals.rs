//! Behavioural signals feeding the threat score.
//!
//! Each signal inspects an entity's recent history and may contribute a
//! weighted score plus a human-readable reason. The detector sums the
//! contributions, caps the total at 1.0 and smooths it over time.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use crate::clock::since;
use crate::threat::context::RequestContext;
use crate::threat::profile::ThreatProfile;

/// Minimum samples before distribution-based signals fire.
pub const MIN_PATTERN_SAMPLES: usize = 10;

const RAPID_FIRE_WINDOW: Duration = Duration::from_secs(10);
const GEO_LOOKBACK: usize = 5;

/// One request as remembered by the detector.
#[derive(Debug, Clone)]
pub struct RequestSample {
    pub at: Instant,
    pub endpoint: String,
    pub user_agent: String,
    pub size: u64,
    pub country: Option<String>,
}

impl RequestSample {
    pub fn from_context(ctx: &RequestContext, at: Instant) -> Self {
        Self {
            at,
            endpoint: ctx.endpoint.clone(),
            user_agent: ctx.user_agent.clone(),
            size: ctx.request_size,
            country: ctx.geo_info.as_ref().map(|g| g.country.clone()),
        }
    }
}

/// Inputs handed to every signal. `history` ends with `current`.
pub struct SignalContext<'a> {
    pub profile: &'a ThreatProfile,
    pub history: &'a VecDeque<RequestSample>,
    pub current: &'a RequestSample,
    pub now: Instant,
}

impl<'a> SignalContext<'a> {
    /// Samples no older than `window`, oldest first.
    pub fn within(&self, window: Duration) -> impl Iterator<Item = &'a RequestSample> + '_ {
        let now = self.now;
        self.history.iter().filter(move |s| since(now, s.at) <= window)
    }

    /// Samples inside the profile's analysis window.
    pub fn recent(&self) -> impl Iterator<Item = &'a RequestSample> + '_ {
        self.within(self.profile.analysis_window())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalHit {
    pub score: f64,
    pub reason: String,
}

impl SignalHit {
    fn new(score: f64, reason: String) -> Self {
        Self { score, reason }
    }
}

pub trait ThreatSignal: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn evaluate(&self, ctx: &SignalContext<'_>) -> Option<SignalHit>;
}

/// Sustained request rate above one per second.
#[derive(Debug, Default)]
pub struct RequestRate;

impl ThreatSignal for RequestRate {
    fn name(&self) -> &'static str {
        "request_rate"
    }

    fn evaluate(&self, ctx: &SignalContext<'_>) -> Option<SignalHit> {
        let recent: Vec<&RequestSample> = ctx.recent().collect();
        let oldest = recent.first()?;
        let span = since(ctx.now, oldest.at).as_secs_f64().max(1.0);
        let rate = recent.len() as f64 / span;
        (rate > 1.0).then(|| SignalHit::new((rate / 10.0).min(0.4), format!("high request rate: {:.1} req/s", rate)))
    }
}

/// Bursts of requests inside a ten second window.
#[derive(Debug, Default)]
pub struct RapidFire;

impl ThreatSignal for RapidFire {
    fn name(&self) -> &'static str {
        "rapid_fire"
    }

    fn evaluate(&self, ctx: &SignalContext<'_>) -> Option<SignalHit> {
        let count = ctx.within(RAPID_FIRE_WINDOW).count();
        (count >= ctx.profile.rapid_fire_threshold as usize)
            .then(|| SignalHit::new(0.3, format!("rapid fire: {} requests in 10s", count)))
    }
}

/// Request body far larger than this entity usually sends.
#[derive(Debug, Default)]
pub struct SizeAnomaly;

impl ThreatSignal for SizeAnomaly {
    fn name(&self) -> &'static str {
        "size_anomaly"
    }

    fn evaluate(&self, ctx: &SignalContext<'_>) -> Option<SignalHit> {
        let previous: Vec<u64> = ctx
            .recent()
            .filter(|s| !std::ptr::eq(*s, ctx.current))
            .map(|s| s.size)
            .collect();
        if previous.is_empty() {
            return None;
        }
        let average = previous.iter().sum::<u64>() as f64 / previous.len() as f64;
        (average > 0.0 && ctx.current.size as f64 > average * 5.0).then(|| {
            SignalHit::new(
                0.2,
                format!("request size anomaly: {} bytes vs {:.0} average", ctx.current.size, average),
            )
        })
    }
}

/// Many distinct endpoints relative to request count.
#[derive(Debug, Default)]
pub struct EndpointScan;

impl ThreatSignal for EndpointScan {
    fn name(&self) -> &'static str {
        "endpoint_scan"
    }

    fn evaluate(&self, ctx: &SignalContext<'_>) -> Option<SignalHit> {
        let recent: Vec<&RequestSample> = ctx.recent().collect();
        if recent.len() < MIN_PATTERN_SAMPLES {
            return None;
        }
        let unique: HashSet<&str> = recent.iter().map(|s| s.endpoint.as_str()).collect();
        let ratio = unique.len() as f64 / recent.len() as f64;
        (ratio > ctx.profile.pattern_deviation_threshold).then(|| {
            SignalHit::new(
                0.2,
                format!("endpoint scanning: {} unique of {} requests", unique.len(), recent.len()),
            )
        })
    }
}

/// One entity rotating through user agents.
#[derive(Debug, Default)]
pub struct UserAgentChurn;

impl ThreatSignal for UserAgentChurn {
    fn name(&self) -> &'static str {
        "user_agent_churn"
    }

    fn evaluate(&self, ctx: &SignalContext<'_>) -> Option<SignalHit> {
        let agents: HashSet<&str> = ctx.recent().map(|s| s.user_agent.as_str()).collect();
        (agents.len() > 3).then(|| SignalHit::new(0.15, format!("user agent rotation: {} distinct", agents.len())))
    }
}

/// Country hopping across the last few requests. Requests without a
/// country never fire.
#[derive(Debug, Default)]
pub struct GeographicAnomaly;

impl ThreatSignal for GeographicAnomaly {
    fn name(&self) -> &'static str {
        "geographic_anomaly"
    }

    fn evaluate(&self, ctx: &SignalContext<'_>) -> Option<SignalHit> {
        // only a located request can be the anomalous one
        ctx.current.country.as_ref()?;
        let countries: HashSet<&str> = ctx
            .history
            .iter()
            .rev()
            .take(GEO_LOOKBACK)
            .filter_map(|s| s.country.as_deref())
            .collect();
        (countries.len() > 2).then(|| {
            SignalHit::new(
                0.2 * ctx.profile.geographic_anomaly_weight,
                format!("geographic anomaly: {} countries in last {} requests", countries.len(), GEO_LOOKBACK),
            )
        })
    }
}

/// The six built-in signals in evaluation order.
pub fn default_signals() -> Vec<Box<dyn ThreatSignal>> {
    vec![
        Box::new(RequestRate),
        Box::new(RapidFire),
        Box::new(SizeAnomaly),
        Box::new(EndpointScan),
        Box::new(UserAgentChurn),
        Box::new(GeographicAnomaly),
    ]
}
