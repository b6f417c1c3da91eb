use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::alerts::{AlertInstance, AlertState};
use crate::data::{Labels, SEVERITY_LABEL};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Firing,
    Resolved,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Firing => "firing",
            NotificationKind::Resolved => "resolved",
        }
    }
}

/// Immutable copy of an alert instance taken at transition time
#[derive(Debug, Clone, Serialize)]
pub struct AlertSnapshot {
    pub rule: String,
    pub labels: Labels,
    pub annotations: BTreeMap<String, String>,
    pub state: AlertState,
    pub value: f64,
    pub active_at: i64,
    pub fired_at: Option<i64>,
    pub resolved_at: Option<i64>,
    pub fingerprint: String,
}

impl AlertSnapshot {
    pub fn of(instance: &AlertInstance) -> Self {
        Self {
            rule: instance.rule.clone(),
            labels: instance.labels.clone(),
            annotations: instance.annotations.clone(),
            state: instance.state,
            value: instance.value,
            active_at: instance.active_at,
            fired_at: instance.fired_at,
            resolved_at: None,
            fingerprint: format!("{:016x}", instance.fingerprint()),
        }
    }
}

/// A firing or resolved transition handed to the routing stage
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: u64,
    pub kind: NotificationKind,
    pub alert: AlertSnapshot,
    /// Periodic re-send of an alert that is still firing
    pub repeat: bool,
    pub created_at: i64,
}

impl Notification {
    pub fn firing(instance: &AlertInstance, now: i64, repeat: bool) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            kind: NotificationKind::Firing,
            alert: AlertSnapshot::of(instance),
            repeat,
            created_at: now,
        }
    }

    pub fn resolved(instance: &AlertInstance, now: i64) -> Self {
        let mut alert = AlertSnapshot::of(instance);
        alert.state = AlertState::Resolved;
        alert.resolved_at = Some(now);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            kind: NotificationKind::Resolved,
            alert,
            repeat: false,
            created_at: now,
        }
    }

    pub fn severity(&self) -> &str {
        self.alert.labels.get(SEVERITY_LABEL).unwrap_or("none")
    }

    /// One-line description used by plain-text receivers
    pub fn summary(&self) -> String {
        let detail = self
            .alert
            .annotations
            .get("summary")
            .cloned()
            .unwrap_or_else(|| format!("{} {}", self.alert.rule, self.alert.labels.without_name()));
        format!(
            "[{}] {} ({}): {}",
            self.kind.as_str().to_uppercase(),
            self.alert.rule,
            self.severity(),
            detail
        )
    }
}

/// Final state of one delivery (notification x receiver)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Delivered,
    Failed,
    Dropped,
}

/// Record of a delivery attempt sequence, kept in the delivery log
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryRecord {
    pub notification_id: u64,
    pub rule: String,
    pub kind: NotificationKind,
    pub fingerprint: String,
    pub receiver: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub finished_at: i64,
}

impl DeliveryRecord {
    pub fn new(
        notification: &Notification,
        receiver: &str,
        status: DeliveryStatus,
        attempts: u32,
        error: Option<String>,
    ) -> Self {
        Self {
            notification_id: notification.id,
            rule: notification.alert.rule.clone(),
            kind: notification.kind,
            fingerprint: notification.alert.fingerprint.clone(),
            receiver: receiver.to_string(),
            status,
            attempts,
            error,
            finished_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}
