//! Self-monitoring counters
//!
//! Rendered in the exposition format on `GET /metrics`.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

use crate::data::{Labels, MetricSample};
use crate::ingest::render_exposition;

/// Name of the per-receiver delivery failure counter
pub const NOTIFICATIONS_FAILED: &str = "klaxon_notifications_failed_total";

#[derive(Debug, Default)]
struct ReceiverCounters {
    delivered: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

#[derive(Debug, Default)]
pub struct Metrics {
    evaluation_ticks: AtomicU64,
    evaluation_ticks_skipped: AtomicU64,
    rule_failures: AtomicU64,
    notifications_emitted: AtomicU64,
    notifications_dropped: AtomicU64,
    config_reloads: AtomicU64,
    config_reload_failures: AtomicU64,
    samples_ingested: AtomicU64,
    receivers: DashMap<String, ReceiverCounters>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tick(&self) {
        self.evaluation_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped_ticks(&self, count: u64) {
        self.evaluation_ticks_skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_rule_failure(&self) {
        self.rule_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emitted(&self, count: u64) {
        self.notifications_emitted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.notifications_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reload(&self, success: bool) {
        if success {
            self.config_reloads.fetch_add(1, Ordering::Relaxed);
        } else {
            self.config_reload_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_ingested(&self, count: u64) {
        self.samples_ingested.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_delivered(&self, receiver: &str) {
        self.receiver(receiver, |c| &c.delivered);
    }

    pub fn record_failed(&self, receiver: &str) {
        self.receiver(receiver, |c| &c.failed);
    }

    pub fn record_retry(&self, receiver: &str) {
        self.receiver(receiver, |c| &c.retries);
    }

    fn receiver(&self, name: &str, counter: impl Fn(&ReceiverCounters) -> &AtomicU64) {
        if let Some(c) = self.receivers.get(name) {
            counter(c.value()).fetch_add(1, Ordering::Relaxed);
            return;
        }
        let entry = self.receivers.entry(name.to_string()).or_default();
        counter(entry.value()).fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed(&self, receiver: &str) -> u64 {
        self.receivers
            .get(receiver)
            .map(|c| c.failed.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn delivered(&self, receiver: &str) -> u64 {
        self.receivers
            .get(receiver)
            .map(|c| c.delivered.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            evaluation_ticks: self.evaluation_ticks.load(Ordering::Relaxed),
            evaluation_ticks_skipped: self.evaluation_ticks_skipped.load(Ordering::Relaxed),
            rule_failures: self.rule_failures.load(Ordering::Relaxed),
            notifications_emitted: self.notifications_emitted.load(Ordering::Relaxed),
            notifications_dropped: self.notifications_dropped.load(Ordering::Relaxed),
            config_reloads: self.config_reloads.load(Ordering::Relaxed),
            config_reload_failures: self.config_reload_failures.load(Ordering::Relaxed),
            samples_ingested: self.samples_ingested.load(Ordering::Relaxed),
        }
    }

    /// Render every counter, followed by caller-supplied gauges
    pub fn render(&self, gauges: &[(&str, f64)]) -> String {
        let s = self.snapshot();
        let mut samples = vec![
            counter("klaxon_evaluation_ticks_total", s.evaluation_ticks),
            counter("klaxon_evaluation_ticks_skipped_total", s.evaluation_ticks_skipped),
            counter("klaxon_rule_evaluation_failures_total", s.rule_failures),
            counter("klaxon_notifications_total", s.notifications_emitted),
            counter("klaxon_notifications_dropped_total", s.notifications_dropped),
            counter("klaxon_config_reloads_total", s.config_reloads),
            counter("klaxon_config_reload_failures_total", s.config_reload_failures),
            counter("klaxon_samples_ingested_total", s.samples_ingested),
        ];

        let mut receivers: Vec<_> = self
            .receivers
            .iter()
            .map(|entry| {
                let c = entry.value();
                (
                    entry.key().clone(),
                    c.delivered.load(Ordering::Relaxed),
                    c.failed.load(Ordering::Relaxed),
                    c.retries.load(Ordering::Relaxed),
                )
            })
            .collect();
        receivers.sort();

        for (name, delivered, failed, retries) in receivers {
            let labels = Labels::from_pairs([("receiver", name.as_str())]);
            samples.push(labelled("klaxon_notifications_delivered_total", &labels, delivered));
            samples.push(labelled(NOTIFICATIONS_FAILED, &labels, failed));
            samples.push(labelled("klaxon_notification_retries_total", &labels, retries));
        }

        for (name, value) in gauges {
            samples.push(MetricSample::new(*name, Labels::new(), *value, 0));
        }

        render_exposition(&samples)
    }
}

fn counter(name: &str, value: u64) -> MetricSample {
    MetricSample::new(name, Labels::new(), value as f64, 0)
}

fn labelled(name: &str, labels: &Labels, value: u64) -> MetricSample {
    MetricSample::new(name, labels.clone(), value as f64, 0)
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub evaluation_ticks: u64,
    pub evaluation_ticks_skipped: u64,
    pub rule_failures: u64,
    pub notifications_emitted: u64,
    pub notifications_dropped: u64,
    pub config_reloads: u64,
    pub config_reload_failures: u64,
    pub samples_ingested: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receiver_counters() {
        let metrics = Metrics::new();
        metrics.record_failed("chat");
        metrics.record_failed("chat");
        metrics.record_delivered("oncall");

        assert_eq!(metrics.failed("chat"), 2);
        assert_eq!(metrics.failed("oncall"), 0);
        assert_eq!(metrics.delivered("oncall"), 1);
    }

    #[test]
    fn test_render() {
        let metrics = Metrics::new();
        metrics.record_tick();
        metrics.record_failed("chat");

        let text = metrics.render(&[("klaxon_alerts_firing", 3.0)]);
        assert!(text.contains("klaxon_evaluation_ticks_total 1\n"));
        assert!(text.contains("klaxon_notifications_failed_total{receiver=\"chat\"} 1\n"));
        assert!(text.contains("klaxon_alerts_firing 3\n"));
    }
}
