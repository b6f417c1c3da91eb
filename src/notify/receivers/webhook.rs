use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use super::{classify_http_error, classify_status, DeliveryOutcome, Receiver};
use crate::notify::notification::Notification;
use crate::notify::NotifyError;

/// Chat-style webhook receiver posting a JSON document per notification
pub struct WebhookReceiver {
    name: String,
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
}

impl WebhookReceiver {
    pub fn new(
        name: &str,
        url: String,
        headers: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let parsed = reqwest::Url::parse(&url)
            .map_err(|e| NotifyError::InvalidConfig(format!("receiver '{}': bad URL: {}", name, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(NotifyError::InvalidConfig(format!(
                "receiver '{}': unsupported URL scheme '{}'",
                name,
                parsed.scheme()
            )));
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            name: name.to_string(),
            url,
            headers,
            client,
        })
    }

    pub fn payload(&self, notification: &Notification) -> serde_json::Value {
        let alert = &notification.alert;
        serde_json::json!({
            "receiver": self.name,
            "status": notification.kind.as_str(),
            "repeat": notification.repeat,
            "text": notification.summary(),
            "alert": {
                "rule": alert.rule,
                "labels": alert.labels,
                "annotations": alert.annotations,
                "value": alert.value,
                "fingerprint": alert.fingerprint,
                "startsAt": rfc3339(alert.active_at),
                "firedAt": alert.fired_at.map(rfc3339),
                "endsAt": alert.resolved_at.map(rfc3339),
            },
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
    }
}

pub(crate) fn rfc3339(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

#[async_trait]
impl Receiver for WebhookReceiver {
    async fn deliver(&self, notification: &Notification) -> DeliveryOutcome {
        let mut request = self.client.post(&self.url).json(&self.payload(notification));

        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let outcome = match request.send().await {
            Ok(response) => classify_status(response.status()),
            Err(e) => classify_http_error(&e),
        };

        if outcome == DeliveryOutcome::Delivered {
            tracing::debug!(
                receiver = %self.name,
                notification_id = notification.id,
                "Webhook notification sent"
            );
        }
        outcome
    }

    fn kind(&self) -> &'static str {
        "webhook"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertInstance, AlertState};
    use crate::data::Labels;
    use std::collections::BTreeMap;

    fn notification() -> Notification {
        let instance = AlertInstance {
            rule: "DiskFull".to_string(),
            labels: Labels::from_pairs([("alertname", "DiskFull"), ("severity", "warning")]),
            annotations: BTreeMap::new(),
            state: AlertState::Firing,
            value: 97.0,
            active_at: 0,
            fired_at: Some(0),
            last_evaluated_at: 0,
            last_notified_at: None,
        };
        Notification::firing(&instance, 0, false)
    }

    #[test]
    fn test_rejects_bad_urls() {
        let timeout = Duration::from_secs(1);
        assert!(WebhookReceiver::new("a", "not a url".into(), HashMap::new(), timeout).is_err());
        assert!(WebhookReceiver::new("a", "ftp://x/y".into(), HashMap::new(), timeout).is_err());
    }

    #[test]
    fn test_payload_shape() {
        let receiver = WebhookReceiver::new(
            "chat",
            "http://127.0.0.1:1/hook".into(),
            HashMap::new(),
            Duration::from_secs(1),
        )
        .unwrap();

        let payload = receiver.payload(&notification());
        assert_eq!(payload["status"], "firing");
        assert_eq!(payload["alert"]["rule"], "DiskFull");
        assert_eq!(payload["alert"]["labels"]["severity"], "warning");
        assert_eq!(payload["alert"]["startsAt"], "1970-01-01T00:00:00+00:00");
        assert!(payload["alert"]["endsAt"].is_null());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_retryable() {
        let receiver = WebhookReceiver::new(
            "chat",
            "http://127.0.0.1:1/hook".into(),
            HashMap::new(),
            Duration::from_secs(1),
        )
        .unwrap();

        let outcome = receiver.deliver(&notification()).await;
        assert!(matches!(outcome, DeliveryOutcome::Retryable(_)));
    }
}
