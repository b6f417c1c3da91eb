use serde::{Deserialize, Serialize};

use super::labels::{Labels, METRIC_NAME_LABEL};

/// A single observation of a metric series
///
/// Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
    pub value: f64,
    pub timestamp: i64,
}

impl MetricSample {
    pub fn new(name: impl Into<String>, labels: Labels, value: f64, timestamp: i64) -> Self {
        Self {
            name: name.into(),
            labels,
            value,
            timestamp,
        }
    }

    /// Full series identity: the label set plus `__name__`
    pub fn series_labels(&self) -> Labels {
        self.labels.clone().with(METRIC_NAME_LABEL, self.name.clone())
    }
}

/// Timestamp/value pair held in a series window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Check that a metric or label name is `[a-zA-Z_:][a-zA-Z0-9_:]*`
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}
