use std::time::Duration;

use async_trait::async_trait;

use super::webhook::rfc3339;
use super::{classify_http_error, classify_status, DeliveryOutcome, Receiver};
use crate::notify::notification::{Notification, NotificationKind};
use crate::notify::NotifyError;

pub const DEFAULT_EVENTS_URL: &str = "https://events.pagerduty.com/v2/enqueue";

pub(crate) fn default_events_url() -> String {
    DEFAULT_EVENTS_URL.to_string()
}

/// Paging service receiver speaking an events-v2 style API
///
/// Firing notifications trigger an incident and resolved notifications close
/// it, correlated by the alert fingerprint as dedup key.
pub struct PagerReceiver {
    name: String,
    url: String,
    routing_key: String,
    client: reqwest::Client,
}

impl PagerReceiver {
    pub fn new(
        name: &str,
        url: String,
        routing_key: String,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        reqwest::Url::parse(&url)
            .map_err(|e| NotifyError::InvalidConfig(format!("receiver '{}': bad URL: {}", name, e)))?;
        if routing_key.trim().is_empty() {
            return Err(NotifyError::InvalidConfig(format!(
                "receiver '{}': empty routing key",
                name
            )));
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            name: name.to_string(),
            url,
            routing_key,
            client,
        })
    }

    pub fn event(&self, notification: &Notification) -> serde_json::Value {
        let alert = &notification.alert;
        let action = match notification.kind {
            NotificationKind::Firing => "trigger",
            NotificationKind::Resolved => "resolve",
        };

        serde_json::json!({
            "routing_key": self.routing_key,
            "event_action": action,
            "dedup_key": alert.fingerprint,
            "payload": {
                "summary": notification.summary(),
                "source": "klaxon",
                "severity": pager_severity(notification.severity()),
                "timestamp": rfc3339(alert.active_at),
                "custom_details": {
                    "labels": alert.labels,
                    "annotations": alert.annotations,
                    "value": alert.value,
                },
            },
        })
    }
}

/// The events API only accepts four severities
fn pager_severity(severity: &str) -> &'static str {
    match severity {
        "critical" | "page" => "critical",
        "error" => "error",
        "info" => "info",
        _ => "warning",
    }
}

#[async_trait]
impl Receiver for PagerReceiver {
    async fn deliver(&self, notification: &Notification) -> DeliveryOutcome {
        let result = self
            .client
            .post(&self.url)
            .json(&self.event(notification))
            .send()
            .await;

        match result {
            Ok(response) => {
                let outcome = classify_status(response.status());
                if let DeliveryOutcome::Permanent(reason) = &outcome {
                    tracing::error!(
                        receiver = %self.name,
                        reason = %reason,
                        "Paging service rejected event"
                    );
                }
                outcome
            }
            Err(e) => classify_http_error(&e),
        }
    }

    fn kind(&self) -> &'static str {
        "pager"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertInstance, AlertState};
    use crate::data::Labels;
    use std::collections::BTreeMap;

    fn instance(severity: &str) -> AlertInstance {
        AlertInstance {
            rule: "InstanceDown".to_string(),
            labels: Labels::from_pairs([("alertname", "InstanceDown"), ("severity", severity)]),
            annotations: BTreeMap::new(),
            state: AlertState::Firing,
            value: 0.0,
            active_at: 1_000,
            fired_at: Some(61_000),
            last_evaluated_at: 61_000,
            last_notified_at: None,
        }
    }

    fn receiver() -> PagerReceiver {
        PagerReceiver::new(
            "oncall",
            DEFAULT_EVENTS_URL.to_string(),
            "R0UT1NG".to_string(),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn test_trigger_and_resolve_share_dedup_key() {
        let receiver = receiver();
        let firing = receiver.event(&Notification::firing(&instance("critical"), 61_000, false));
        let resolved = receiver.event(&Notification::resolved(&instance("critical"), 90_000));

        assert_eq!(firing["event_action"], "trigger");
        assert_eq!(resolved["event_action"], "resolve");
        assert_eq!(firing["dedup_key"], resolved["dedup_key"]);
        assert_eq!(firing["payload"]["severity"], "critical");
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(pager_severity("page"), "critical");
        assert_eq!(pager_severity("warning"), "warning");
        assert_eq!(pager_severity("whatever"), "warning");
    }

    #[test]
    fn test_empty_routing_key_rejected() {
        let result = PagerReceiver::new(
            "oncall",
            DEFAULT_EVENTS_URL.to_string(),
            " ".to_string(),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(NotifyError::InvalidConfig(_))));
    }
}
