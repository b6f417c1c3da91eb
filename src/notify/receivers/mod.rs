//! Receiver integrations
//!
//! Every receiver implements [`Receiver::deliver`] and reports whether the
//! attempt succeeded, may be retried, or failed for good.

pub mod email;
pub mod log;
pub mod pager;
pub mod webhook;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de, Deserialize, Deserializer};

use super::notification::Notification;
use super::secrets::SecretStore;
use super::NotifyError;
use crate::rules::duration::serde_literal;

pub use email::EmailReceiver;
pub use log::LogReceiver;
pub use pager::PagerReceiver;
pub use webhook::WebhookReceiver;

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Timeouts, connection errors, 5xx and 429 responses
    Retryable(String),
    /// Bad credentials, malformed target, rejected payload
    Permanent(String),
}

#[async_trait]
pub trait Receiver: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> DeliveryOutcome;

    /// Integration type name (`"webhook"`, `"email"`, ...)
    fn kind(&self) -> &'static str;
}

/// Receiver entry of the rule file. Unknown keys are rejected.
#[derive(Debug, Clone)]
pub struct ReceiverSpec {
    pub name: String,
    pub kind: ReceiverKind,
    /// Re-send interval while an alert keeps firing
    pub repeat_interval: Option<Duration>,
}

/// Keys every receiver accepts
const COMMON_KEYS: &[&str] = &["name", "type", "repeat_interval"];

impl ReceiverKind {
    /// Keys accepted for a `type`, or `None` for an unknown type
    fn keys(kind: &str) -> Option<&'static [&'static str]> {
        match kind {
            "log" => Some(&[]),
            "webhook" => Some(&["url_secret", "headers"]),
            "pager" => Some(&["routing_key_secret", "url"]),
            "email" => Some(&[
                "to",
                "from",
                "smtp_host",
                "smtp_port",
                "username",
                "password_secret",
            ]),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct ReceiverEntry {
    name: String,
    #[serde(flatten)]
    kind: ReceiverKind,
    #[serde(default, with = "serde_literal::option")]
    repeat_interval: Option<Duration>,
}

impl<'de> Deserialize<'de> for ReceiverSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map = serde_yaml::Mapping::deserialize(deserializer)?;

        let kind = map.get("type").and_then(|v| v.as_str()).unwrap_or_default();
        if let Some(kind_keys) = ReceiverKind::keys(kind) {
            for key in map.keys() {
                let key = key.as_str().unwrap_or_default();
                if !COMMON_KEYS.contains(&key) && !kind_keys.contains(&key) {
                    return Err(de::Error::custom(format!(
                        "unknown field `{}` for {} receiver",
                        key, kind
                    )));
                }
            }
        }

        let entry: ReceiverEntry =
            serde_yaml::from_value(serde_yaml::Value::Mapping(map)).map_err(de::Error::custom)?;
        Ok(Self {
            name: entry.name,
            kind: entry.kind,
            repeat_interval: entry.repeat_interval,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReceiverKind {
    Log,
    /// Chat webhook; the URL is a secret because it embeds a token
    Webhook {
        url_secret: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// Paging service events API
    Pager {
        routing_key_secret: String,
        #[serde(default = "pager::default_events_url")]
        url: String,
    },
    Email {
        to: Vec<String>,
        from: String,
        smtp_host: String,
        #[serde(default = "email::default_smtp_port")]
        smtp_port: u16,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password_secret: Option<String>,
    },
}

fn secret(secrets: &dyn SecretStore, receiver: &str, name: &str) -> Result<String, NotifyError> {
    secrets.get(name).ok_or_else(|| NotifyError::MissingSecret {
        receiver: receiver.to_string(),
        secret: name.to_string(),
    })
}

/// Build a receiver, resolving its credentials
pub fn build_receiver(
    spec: &ReceiverSpec,
    secrets: &dyn SecretStore,
    timeout: Duration,
) -> Result<Arc<dyn Receiver>, NotifyError> {
    let receiver: Arc<dyn Receiver> = match &spec.kind {
        ReceiverKind::Log => Arc::new(LogReceiver::new(&spec.name)),
        ReceiverKind::Webhook {
            url_secret,
            headers,
        } => {
            let url = secret(secrets, &spec.name, url_secret)?;
            Arc::new(WebhookReceiver::new(&spec.name, url, headers.clone(), timeout)?)
        }
        ReceiverKind::Pager {
            routing_key_secret,
            url,
        } => {
            let routing_key = secret(secrets, &spec.name, routing_key_secret)?;
            Arc::new(PagerReceiver::new(&spec.name, url.clone(), routing_key, timeout)?)
        }
        ReceiverKind::Email {
            to,
            from,
            smtp_host,
            smtp_port,
            username,
            password_secret,
        } => {
            let password = password_secret
                .as_deref()
                .map(|name| secret(secrets, &spec.name, name))
                .transpose()?;
            Arc::new(EmailReceiver::new(
                &spec.name,
                smtp_host,
                *smtp_port,
                username.as_deref(),
                password.as_deref(),
                from,
                to,
                timeout,
            )?)
        }
    };
    Ok(receiver)
}

/// Map a transport error to a delivery outcome
pub(crate) fn classify_http_error(e: &reqwest::Error) -> DeliveryOutcome {
    if e.is_builder() {
        DeliveryOutcome::Permanent(format!("Invalid request: {}", e))
    } else {
        DeliveryOutcome::Retryable(format!("Request failed: {}", e))
    }
}

/// Map an HTTP status to a delivery outcome
pub(crate) fn classify_status(status: reqwest::StatusCode) -> DeliveryOutcome {
    if status.is_success() {
        DeliveryOutcome::Delivered
    } else if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        DeliveryOutcome::Retryable(format!("Receiver returned status {}", status))
    } else {
        DeliveryOutcome::Permanent(format!("Receiver returned status {}", status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::secrets::StaticSecretStore;

    #[test]
    fn test_classify_status() {
        use reqwest::StatusCode;
        assert_eq!(classify_status(StatusCode::OK), DeliveryOutcome::Delivered);
        assert_eq!(classify_status(StatusCode::ACCEPTED), DeliveryOutcome::Delivered);
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            DeliveryOutcome::Retryable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            DeliveryOutcome::Retryable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED),
            DeliveryOutcome::Permanent(_)
        ));
    }

    #[test]
    fn test_spec_deserializes() {
        let yaml = r#"
- name: chat
  type: webhook
  url_secret: chat-webhook
  repeat_interval: 4h
- name: oncall
  type: pager
  routing_key_secret: pager-key
- name: ops-mail
  type: email
  to: [ops@example.com]
  from: klaxon@example.com
  smtp_host: smtp.example.com
"#;
        let specs: Vec<ReceiverSpec> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].repeat_interval, Some(Duration::from_secs(4 * 3600)));
        assert!(matches!(specs[1].kind, ReceiverKind::Pager { ref url, .. } if url == pager::DEFAULT_EVENTS_URL));
        assert!(matches!(specs[2].kind, ReceiverKind::Email { smtp_port: 587, .. }));
    }

    #[test]
    fn test_unknown_receiver_keys_rejected() {
        let typo = "- name: chat\n  type: webhook\n  url_secret: chat-webhook\n  repeat_intervall: 4h\n";
        let err = serde_yaml::from_str::<Vec<ReceiverSpec>>(typo).unwrap_err();
        assert!(err.to_string().contains("repeat_intervall"));

        // A key valid for another receiver type is still unknown here
        let foreign = "- name: chat\n  type: log\n  smtp_host: smtp.example.com\n";
        assert!(serde_yaml::from_str::<Vec<ReceiverSpec>>(foreign).is_err());

        let unknown_type = "- name: chat\n  type: carrier-pigeon\n";
        assert!(serde_yaml::from_str::<Vec<ReceiverSpec>>(unknown_type).is_err());
    }

    #[test]
    fn test_missing_secret_rejected() {
        let spec = ReceiverSpec {
            name: "chat".to_string(),
            kind: ReceiverKind::Webhook {
                url_secret: "chat-webhook".to_string(),
                headers: HashMap::new(),
            },
            repeat_interval: None,
        };
        let result = build_receiver(&spec, &StaticSecretStore::new(), Duration::from_secs(5));
        assert!(matches!(result, Err(NotifyError::MissingSecret { .. })));

        let secrets = StaticSecretStore::new().with("chat-webhook", "https://chat.example.com/hook/T0K3N");
        let receiver = build_receiver(&spec, &secrets, Duration::from_secs(5)).unwrap();
        assert_eq!(receiver.kind(), "webhook");
    }
}
