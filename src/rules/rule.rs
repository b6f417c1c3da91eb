use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use super::duration::{duration_millis, serde_literal};
use super::eval::DEFAULT_LOOKBACK;
use super::expr::AlertExpr;
use crate::data::{Labels, ALERT_NAME_LABEL, SEVERITY_LABEL};

/// A validated alerting rule
#[derive(Debug, Clone, Serialize)]
pub struct AlertRule {
    pub name: String,
    #[serde(serialize_with = "serialize_expr")]
    pub expr: AlertExpr,
    /// Time the condition must hold before the alert fires
    #[serde(rename = "for", with = "serde_literal")]
    pub for_duration: Duration,
    pub severity: String,
    /// Static labels attached to every alert of this rule
    pub labels: Labels,
    /// Annotation templates (`summary`, `description`, ...)
    pub annotations: BTreeMap<String, String>,
}

impl AlertRule {
    pub fn new(name: impl Into<String>, expr: AlertExpr) -> Self {
        Self {
            name: name.into(),
            expr,
            for_duration: Duration::ZERO,
            severity: "warning".to_string(),
            labels: Labels::new(),
            annotations: BTreeMap::new(),
        }
    }

    pub fn with_for(mut self, for_duration: Duration) -> Self {
        self.for_duration = for_duration;
        self
    }

    pub fn with_severity(mut self, severity: impl Into<String>) -> Self {
        self.severity = severity.into();
        self
    }

    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name, value);
        self
    }

    pub fn with_annotation(mut self, name: impl Into<String>, template: impl Into<String>) -> Self {
        self.annotations.insert(name.into(), template.into());
        self
    }

    pub fn for_millis(&self) -> i64 {
        duration_millis(self.for_duration)
    }

    /// History the store must retain for this rule to evaluate
    pub fn required_history(&self) -> Duration {
        let window = self.expr.max_window().unwrap_or(Duration::ZERO);
        if self.expr.vector.has_instant_selector() {
            window.max(DEFAULT_LOOKBACK)
        } else {
            window
        }
    }

    /// Alert labels for a matching series: series labels, then rule labels,
    /// then `alertname` and `severity`
    pub fn alert_labels(&self, series: &Labels) -> Labels {
        let mut labels = series.clone();
        labels.merge(&self.labels);
        labels.insert(ALERT_NAME_LABEL, self.name.clone());
        labels.insert(SEVERITY_LABEL, self.severity.clone());
        labels
    }
}

fn serialize_expr<S>(expr: &AlertExpr, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.collect_str(expr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::parse_expr;

    #[test]
    fn test_alert_labels_precedence() {
        let rule = AlertRule::new("HighErrorRate", parse_expr("errors > 1").unwrap())
            .with_severity("critical")
            .with_label("team", "payments")
            .with_label("severity", "ignored");

        let labels = rule.alert_labels(&Labels::from_pairs([("job", "api"), ("team", "web")]));
        assert_eq!(labels.get("alertname"), Some("HighErrorRate"));
        assert_eq!(labels.get("severity"), Some("critical"));
        assert_eq!(labels.get("team"), Some("payments"));
        assert_eq!(labels.get("job"), Some("api"));
    }

    #[test]
    fn test_required_history() {
        let rule = AlertRule::new("a", parse_expr("rate(x_total[10m]) > 1").unwrap());
        assert_eq!(rule.required_history(), Duration::from_secs(600));

        let rule = AlertRule::new("b", parse_expr("up == 0").unwrap());
        assert_eq!(rule.required_history(), DEFAULT_LOOKBACK);
    }
}
