use async_trait::async_trait;

use super::{DeliveryOutcome, Receiver};
use crate::notify::notification::{Notification, NotificationKind};

/// Writes notifications to the tracing log
pub struct LogReceiver {
    name: String,
}

impl LogReceiver {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Receiver for LogReceiver {
    async fn deliver(&self, notification: &Notification) -> DeliveryOutcome {
        match notification.kind {
            NotificationKind::Firing => tracing::warn!(
                receiver = %self.name,
                rule = %notification.alert.rule,
                labels = %notification.alert.labels,
                repeat = notification.repeat,
                "{}",
                notification.summary()
            ),
            NotificationKind::Resolved => tracing::info!(
                receiver = %self.name,
                rule = %notification.alert.rule,
                labels = %notification.alert.labels,
                "{}",
                notification.summary()
            ),
        }
        DeliveryOutcome::Delivered
    }

    fn kind(&self) -> &'static str {
        "log"
    }
}
