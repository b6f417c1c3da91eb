//! Alert instance state

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::data::Labels;

/// Stored state of an alert instance
///
/// `Inactive` is implicit (no instance) and `Resolved` is transient: the
/// instance is removed in the same tick it resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    Pending,
    Firing,
    Resolved,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::Pending => "pending",
            AlertState::Firing => "firing",
            AlertState::Resolved => "resolved",
        }
    }
}

/// Identity of an instance: one per (rule, series label set)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub rule: String,
    pub labels: Labels,
}

impl InstanceKey {
    pub fn new(rule: impl Into<String>, labels: Labels) -> Self {
        Self {
            rule: rule.into(),
            labels,
        }
    }
}

/// A rule matched against one label set
#[derive(Debug, Clone, Serialize)]
pub struct AlertInstance {
    pub rule: String,
    /// Full alert labels (series labels + rule labels + alertname/severity)
    pub labels: Labels,
    pub annotations: BTreeMap<String, String>,
    pub state: AlertState,
    /// Last observed expression value
    pub value: f64,
    /// Tick at which the condition first became true
    pub active_at: i64,
    /// Tick at which the instance entered Firing
    pub fired_at: Option<i64>,
    pub last_evaluated_at: i64,
    /// Tick of the last firing notification sent for this instance
    pub last_notified_at: Option<i64>,
}

impl AlertInstance {
    pub fn fingerprint(&self) -> u64 {
        self.labels.fingerprint()
    }

    pub fn is_firing(&self) -> bool {
        self.state == AlertState::Firing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&AlertState::Firing).unwrap();
        assert_eq!(json, "\"firing\"");
        assert_eq!(AlertState::Pending.as_str(), "pending");
    }

    #[test]
    fn test_keys_are_per_rule_and_labels() {
        let labels = Labels::from_pairs([("job", "api")]);
        let a = InstanceKey::new("HighErrorRate", labels.clone());
        let b = InstanceKey::new("HighLatency", labels.clone());
        assert_ne!(a, b);
        assert_eq!(a, InstanceKey::new("HighErrorRate", labels));
    }
}
