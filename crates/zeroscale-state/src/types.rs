//! Domain types for zeroscale.
//!
//! Resources, their metric-driven scaling rules, the five-state scale
//! lifecycle, and the readiness signal that held requests wait on.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::RawScaleResource;
use crate::error::ConfigError;

/// Unique identifier for a resource (namespace-scoped by the backend).
pub type ResourceName = String;

// ── Scale state ────────────────────────────────────────────────────

/// What a resource is currently doing.
///
/// ```text
/// non ──▶ scalingFromZero ──▶ scaledFromZero ──▶ scalingToZero ──▶ scaledToZero
///  ▲            │   ▲                ▲                 │                 │
///  └────────────┘   │                └─────────────────┘                 │
///   (timeout)       └────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ScaleState {
    /// Not yet evaluated. Treated as running.
    Non,
    ScalingFromZero,
    ScaledFromZero,
    ScalingToZero,
    ScaledToZero,
}

impl ScaleState {
    pub const ALL: [ScaleState; 5] = [
        ScaleState::Non,
        ScaleState::ScalingFromZero,
        ScaleState::ScaledFromZero,
        ScaleState::ScalingToZero,
        ScaleState::ScaledToZero,
    ];

    /// Canonical wire encoding.
    pub fn as_str(self) -> &'static str {
        match self {
            ScaleState::Non => "non",
            ScaleState::ScalingFromZero => "scalingFromZero",
            ScaleState::ScaledFromZero => "scaledFromZero",
            ScaleState::ScalingToZero => "scalingToZero",
            ScaleState::ScaledToZero => "scaledToZero",
        }
    }

    /// Decode a persisted state string, falling back to `Non` when it is
    /// not recognized so the resource gets re-evaluated from scratch.
    pub fn decode_or_non(s: &str) -> ScaleState {
        match s.parse() {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "treating unrecognized scale state as non");
                ScaleState::Non
            }
        }
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: ScaleState) -> bool {
        use ScaleState::*;
        matches!(
            (self, next),
            (Non, ScalingFromZero)
                | (ScalingFromZero, ScaledFromZero)
                | (ScalingFromZero, Non)
                | (ScaledFromZero, ScalingToZero)
                | (ScalingToZero, ScaledToZero)
                | (ScalingToZero, ScaledFromZero)
                | (ScaledToZero, ScalingFromZero)
        )
    }

    /// Whether replicas are expected to be serving traffic.
    pub fn is_serving(self) -> bool {
        matches!(self, ScaleState::Non | ScaleState::ScaledFromZero)
    }
}

impl fmt::Display for ScaleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScaleState {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "non" => Ok(ScaleState::Non),
            "scalingFromZero" => Ok(ScaleState::ScalingFromZero),
            "scaledFromZero" => Ok(ScaleState::ScaledFromZero),
            "scalingToZero" => Ok(ScaleState::ScalingToZero),
            "scaledToZero" => Ok(ScaleState::ScaledToZero),
            other => Err(ConfigError::UnknownState(other.to_string())),
        }
    }
}

impl TryFrom<String> for ScaleState {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ScaleState> for String {
    fn from(state: ScaleState) -> Self {
        state.as_str().to_string()
    }
}

// ── Scaling rules ──────────────────────────────────────────────────

/// How samples inside a window are combined into one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reducer {
    #[default]
    Sum,
    Average,
    Max,
}

impl Reducer {
    /// Reduce a set of values. Empty input reduces to 0.
    pub fn apply(self, values: impl IntoIterator<Item = f64>) -> f64 {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut max = f64::MIN;
        for v in values {
            count += 1;
            sum += v;
            max = max.max(v);
        }
        if count == 0 {
            return 0.0;
        }
        match self {
            Reducer::Sum => sum,
            Reducer::Average => sum / count as f64,
            Reducer::Max => max,
        }
    }
}

/// One metric-driven scaling rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawScaleResource", into = "RawScaleResource")]
pub struct ScaleResource {
    pub metric_name: String,
    pub window: Duration,
    pub threshold: u64,
    pub reducer: Reducer,
}

impl ScaleResource {
    /// Build a validated rule.
    pub fn new(
        metric_name: impl Into<String>,
        window: Duration,
        threshold: i64,
    ) -> Result<Self, ConfigError> {
        let metric_name = metric_name.into();
        if metric_name.trim().is_empty() {
            return Err(ConfigError::EmptyMetricName);
        }
        if window.is_zero() {
            return Err(ConfigError::NonPositiveWindow { metric: metric_name });
        }
        if threshold < 0 {
            return Err(ConfigError::NegativeThreshold {
                metric: metric_name,
                threshold,
            });
        }
        Ok(Self {
            metric_name,
            window,
            threshold: threshold as u64,
            reducer: Reducer::Sum,
        })
    }

    pub fn with_reducer(mut self, reducer: Reducer) -> Self {
        self.reducer = reducer;
        self
    }

    /// Whether the aggregate is low enough to allow scale-to-zero.
    ///
    /// A zero threshold means "no activity at all".
    pub fn is_idle(&self, aggregate: f64) -> bool {
        if self.threshold == 0 {
            aggregate <= 0.0
        } else {
            aggregate < self.threshold as f64
        }
    }

    /// Whether the aggregate shows enough demand to wake the resource.
    pub fn shows_demand(&self, aggregate: f64) -> bool {
        aggregate > self.threshold as f64
    }
}

/// A resource as listed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: ResourceName,
    #[serde(default)]
    pub scale_resources: Vec<ScaleResource>,
}

impl Resource {
    pub fn new(name: impl Into<String>, scale_resources: Vec<ScaleResource>) -> Self {
        Self {
            name: name.into(),
            scale_resources,
        }
    }
}

// ── Metrics ────────────────────────────────────────────────────────

/// A single metric observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: SystemTime,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: SystemTime, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Half-open query range `[start, end)` for the metrics source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: SystemTime,
    pub end: SystemTime,
}

impl TimeRange {
    /// The range covering the last `span` up to now.
    pub fn last(span: Duration) -> Self {
        let end = SystemTime::now();
        Self {
            start: end.checked_sub(span).unwrap_or(SystemTime::UNIX_EPOCH),
            end,
        }
    }
}

// ── Readiness ──────────────────────────────────────────────────────

/// Result of a scale-from-zero episode as seen by waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Ready,
    TimedOut,
    Failed,
}

/// Value published on a resource's readiness channel.
///
/// `episode` increments on every transition into `scalingFromZero`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub episode: u64,
    pub outcome: Outcome,
}

// ── Snapshots ──────────────────────────────────────────────────────

/// Read-only view of a registry entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub name: ResourceName,
    pub state: ScaleState,
    pub scale_resources: Vec<ScaleResource>,
    /// Milliseconds since the last state transition.
    pub since_transition_ms: u64,
    pub episode: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_state_round_trip() {
        for state in ScaleState::ALL {
            let decoded: ScaleState = state.as_str().parse().unwrap();
            assert_eq!(decoded, state);
        }
    }

    #[test]
    fn unknown_state_is_rejected() {
        let err = "fromZero".parse::<ScaleState>().unwrap_err();
        assert_eq!(err, ConfigError::UnknownState("fromZero".to_string()));
    }

    #[test]
    fn unknown_state_decodes_to_non() {
        assert_eq!(ScaleState::decode_or_non("toZero"), ScaleState::Non);
        assert_eq!(ScaleState::decode_or_non(""), ScaleState::Non);
        assert_eq!(
            ScaleState::decode_or_non("scaledToZero"),
            ScaleState::ScaledToZero
        );
    }

    #[test]
    fn scale_state_serde_uses_wire_names() {
        let json = serde_json::to_string(&ScaleState::ScalingFromZero).unwrap();
        assert_eq!(json, "\"scalingFromZero\"");
        assert!(serde_json::from_str::<ScaleState>("\"bogus\"").is_err());
    }

    #[test]
    fn lifecycle_cycle_is_legal() {
        use ScaleState::*;
        let cycle = [
            Non,
            ScalingFromZero,
            ScaledFromZero,
            ScalingToZero,
            ScaledToZero,
            ScalingFromZero,
        ];
        for pair in cycle.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn shortcuts_are_illegal() {
        use ScaleState::*;
        assert!(!Non.can_transition_to(ScaledToZero));
        assert!(!ScaledToZero.can_transition_to(ScaledFromZero));
        assert!(!ScaledFromZero.can_transition_to(ScaledToZero));
        assert!(!ScalingToZero.can_transition_to(ScalingFromZero));
        for state in ScaleState::ALL {
            assert!(!state.can_transition_to(state));
        }
    }

    #[test]
    fn rule_validation() {
        assert!(ScaleResource::new("requests", Duration::from_secs(60), 0).is_ok());
        assert_eq!(
            ScaleResource::new("requests", Duration::ZERO, 1).unwrap_err(),
            ConfigError::NonPositiveWindow {
                metric: "requests".to_string()
            }
        );
        assert!(matches!(
            ScaleResource::new("requests", Duration::from_secs(1), -1),
            Err(ConfigError::NegativeThreshold { threshold: -1, .. })
        ));
        assert_eq!(
            ScaleResource::new(" ", Duration::from_secs(1), 1).unwrap_err(),
            ConfigError::EmptyMetricName
        );
    }

    #[test]
    fn idle_and_demand_thresholds() {
        let zero = ScaleResource::new("requests", Duration::from_secs(60), 0).unwrap();
        assert!(zero.is_idle(0.0));
        assert!(!zero.is_idle(1.0));
        assert!(zero.shows_demand(1.0));

        let ten = ScaleResource::new("requests", Duration::from_secs(60), 10).unwrap();
        assert!(ten.is_idle(9.0));
        assert!(!ten.is_idle(10.0));
        assert!(!ten.shows_demand(10.0));
        assert!(ten.shows_demand(11.0));
    }

    #[test]
    fn reducers() {
        let values = [1.0, 5.0, 3.0];
        assert_eq!(Reducer::Sum.apply(values), 9.0);
        assert_eq!(Reducer::Average.apply(values), 3.0);
        assert_eq!(Reducer::Max.apply(values), 5.0);
        assert_eq!(Reducer::Max.apply([]), 0.0);
    }
}
