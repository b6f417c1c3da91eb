use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::webhook::rfc3339;
use super::{DeliveryOutcome, Receiver};
use crate::notify::notification::Notification;
use crate::notify::NotifyError;

pub(crate) fn default_smtp_port() -> u16 {
    587
}

/// SMTP receiver sending one plain-text mail per notification
pub struct EmailReceiver {
    name: String,
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl EmailReceiver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        smtp_host: &str,
        smtp_port: u16,
        username: Option<&str>,
        password: Option<&str>,
        from: &str,
        to: &[String],
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let from = parse_mailbox(name, from)?;
        let to = to
            .iter()
            .map(|address| parse_mailbox(name, address))
            .collect::<Result<Vec<_>, _>>()?;
        if to.is_empty() {
            return Err(NotifyError::InvalidConfig(format!(
                "receiver '{}': no recipients",
                name
            )));
        }

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(smtp_host)?
            .port(smtp_port)
            .timeout(Some(timeout));

        if let (Some(user), Some(pass)) = (username, password) {
            builder = builder.credentials(Credentials::new(user.to_string(), pass.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            transport: builder.build(),
            from,
            to,
        })
    }

    fn subject(notification: &Notification) -> String {
        let mut subject = format!(
            "[klaxon][{}][{}] {}",
            notification.kind.as_str().to_uppercase(),
            notification.severity(),
            notification.alert.rule
        );
        if notification.repeat {
            subject.push_str(" (repeat)");
        }
        subject
    }

    fn body(notification: &Notification) -> String {
        let alert = &notification.alert;
        let mut body = format!(
            "{}\n\nRule: {}\nLabels: {}\nValue: {}\nActive since: {}\n",
            notification.summary(),
            alert.rule,
            alert.labels,
            alert.value,
            rfc3339(alert.active_at),
        );
        if let Some(resolved_at) = alert.resolved_at {
            body.push_str(&format!("Resolved at: {}\n", rfc3339(resolved_at)));
        }
        for (name, text) in &alert.annotations {
            body.push_str(&format!("{}: {}\n", name, text));
        }
        body
    }

    fn message(&self, notification: &Notification) -> Result<Message, lettre::error::Error> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(Self::subject(notification))
            .header(ContentType::TEXT_PLAIN);
        for recipient in &self.to {
            builder = builder.to(recipient.clone());
        }
        builder.body(Self::body(notification))
    }
}

fn parse_mailbox(receiver: &str, address: &str) -> Result<Mailbox, NotifyError> {
    address.parse().map_err(|_| NotifyError::InvalidAddress {
        receiver: receiver.to_string(),
        address: address.to_string(),
    })
}

#[async_trait]
impl Receiver for EmailReceiver {
    async fn deliver(&self, notification: &Notification) -> DeliveryOutcome {
        let message = match self.message(notification) {
            Ok(m) => m,
            Err(e) => return DeliveryOutcome::Permanent(format!("Invalid message: {}", e)),
        };

        match self.transport.send(message).await {
            Ok(_) => {
                tracing::debug!(
                    receiver = %self.name,
                    notification_id = notification.id,
                    recipients = self.to.len(),
                    "Email notification sent"
                );
                DeliveryOutcome::Delivered
            }
            Err(e) if e.is_permanent() => DeliveryOutcome::Permanent(format!("SMTP rejected: {}", e)),
            Err(e) => DeliveryOutcome::Retryable(format!("SMTP failed: {}", e)),
        }
    }

    fn kind(&self) -> &'static str {
        "email"
    }
}
