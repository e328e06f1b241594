//! Metric data model and wire format.
//!
//! A metric identity is the pair (kind, id). Gauges carry an absolute
//! floating value and overwrite on store; counters carry an integer
//! delta and accumulate on store. On the wire a metric is a flat JSON
//! object `{"id", "type", "value"?, "delta"?}`; decoding goes through
//! [`Metric`]'s `try_from` conversion so an unknown kind or a missing
//! payload field is rejected at the deserialization boundary.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while decoding a wire metric.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown metric kind: {0}")]
    UnknownKind(String),

    #[error("gauge {0} is missing its value")]
    MissingValue(String),

    #[error("counter {0} is missing its delta")]
    MissingDelta(String),
}

/// The two metric kinds the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    /// Wire string for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }

    /// Parse a wire string. Anything but "gauge"/"counter" is rejected.
    pub fn parse(s: &str) -> Result<Self, ModelError> {
        match s {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            other => Err(ModelError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metric payload: an absolute gauge value or a counter delta.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Gauge(f64),
    Counter(i64),
}

/// A single metric submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMetric", into = "WireMetric")]
pub struct Metric {
    pub id: String,
    pub value: MetricValue,
}

impl Metric {
    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            value: MetricValue::Gauge(value),
        }
    }

    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self {
            id: id.into(),
            value: MetricValue::Counter(delta),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self.value {
            MetricValue::Gauge(_) => MetricKind::Gauge,
            MetricValue::Counter(_) => MetricKind::Counter,
        }
    }

    pub fn gauge_value(&self) -> Option<f64> {
        match self.value {
            MetricValue::Gauge(v) => Some(v),
            MetricValue::Counter(_) => None,
        }
    }

    pub fn counter_delta(&self) -> Option<i64> {
        match self.value {
            MetricValue::Counter(d) => Some(d),
            MetricValue::Gauge(_) => None,
        }
    }
}

/// Flat wire shape: `{"id", "type", "value"?, "delta"?}`.
#[derive(Debug, Serialize, Deserialize)]
struct WireMetric {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    delta: Option<i64>,
}

impl TryFrom<WireMetric> for Metric {
    type Error = ModelError;

    fn try_from(wire: WireMetric) -> Result<Self, Self::Error> {
        let value = match MetricKind::parse(&wire.kind)? {
            MetricKind::Gauge => MetricValue::Gauge(
                wire.value.ok_or_else(|| ModelError::MissingValue(wire.id.clone()))?,
            ),
            MetricKind::Counter => MetricValue::Counter(
                wire.delta.ok_or_else(|| ModelError::MissingDelta(wire.id.clone()))?,
            ),
        };
        Ok(Metric { id: wire.id, value })
    }
}

impl From<Metric> for WireMetric {
    fn from(metric: Metric) -> Self {
        let kind = metric.kind().as_str().to_string();
        let (value, delta) = match metric.value {
            MetricValue::Gauge(v) => (Some(v), None),
            MetricValue::Counter(d) => (None, Some(d)),
        };
        WireMetric {
            id: metric.id,
            kind,
            value,
            delta,
        }
    }
}
