//! Background evaluation loop
//!
//! A single task owns the [`AlertEvaluator`] and runs it on a fixed tick.
//! Ticks never overlap: evaluation runs inline, and ticks missed while a
//! slow evaluation was running are skipped. After each tick an immutable
//! snapshot of the instance table is published for readers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};

use super::evaluator::AlertEvaluator;
use super::instance::{AlertInstance, AlertState};
use crate::config::AlertConfig;
use crate::metrics::Metrics;
use crate::notify::{DispatchHandle, Notification};
use crate::rules::duration_millis;
use crate::storage::SeriesStore;

/// Read-only view of the instance table after a tick
#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertsSnapshot {
    pub ticks: u64,
    /// Unix millis of the last completed tick
    pub evaluated_at: Option<i64>,
    pub alerts: Vec<AlertInstance>,
    /// Rules that failed on the last tick, with the error
    pub rule_errors: BTreeMap<String, String>,
}

impl AlertsSnapshot {
    pub fn count(&self, state: AlertState) -> usize {
        self.alerts.iter().filter(|a| a.state == state).count()
    }
}

pub struct EvaluationLoop {
    evaluator: AlertEvaluator,
    store: Arc<SeriesStore>,
    config: watch::Receiver<Arc<AlertConfig>>,
    dispatch: DispatchHandle,
    metrics: Arc<Metrics>,
    interval: Duration,
    ticks: u64,
    snapshot_tx: watch::Sender<Arc<AlertsSnapshot>>,
}

impl EvaluationLoop {
    pub fn new(
        store: Arc<SeriesStore>,
        config: watch::Receiver<Arc<AlertConfig>>,
        dispatch: DispatchHandle,
        metrics: Arc<Metrics>,
        interval: Duration,
    ) -> (Self, watch::Receiver<Arc<AlertsSnapshot>>) {
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(AlertsSnapshot::default()));
        (
            Self {
                evaluator: AlertEvaluator::new(),
                store,
                config,
                dispatch,
                metrics,
                interval,
                ticks: 0,
                snapshot_tx,
            },
            snapshot_rx,
        )
    }

    /// Spawn the loop
    pub fn start(mut self) -> EvaluationTask {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last: Option<Instant> = None;

            tracing::info!(interval_secs = self.interval.as_secs(), "Evaluation loop started");

            loop {
                tokio::select! {
                    scheduled = ticker.tick() => {
                        if let Some(prev) = last {
                            let missed = skipped_ticks(scheduled - prev, self.interval);
                            if missed > 0 {
                                tracing::warn!(missed, "Evaluation overran its interval, skipping ticks");
                                self.metrics.record_skipped_ticks(missed);
                            }
                        }
                        last = Some(scheduled);
                        self.tick(chrono::Utc::now().timestamp_millis());
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Evaluation loop shutting down");
                        break;
                    }
                }
            }
        });

        EvaluationTask {
            handle,
            shutdown_tx,
        }
    }

    /// Run one evaluation at `now` (unix millis)
    pub fn tick(&mut self, now: i64) {
        if self.config.has_changed().unwrap_or(false) {
            let config = Arc::clone(&self.config.borrow_and_update());
            let resolved = self.evaluator.reconcile(&config.rules, now);
            tracing::info!(
                rules = config.rules.len(),
                dropped_resolved = resolved.len(),
                "Evaluation picked up new configuration"
            );
            self.emit(&config, resolved);
        }
        let config = Arc::clone(&self.config.borrow());

        self.store
            .set_retention_ms(duration_millis(config.retention()));
        let evicted = self.store.evict_expired(now);
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted samples outside retention");
        }

        let outcome = self
            .evaluator
            .evaluate(&config.rules, &config.router, &self.store, now);
        self.ticks += 1;
        self.metrics.record_tick();
        for _ in &outcome.failed_rules {
            self.metrics.record_rule_failure();
        }

        let rule_errors = outcome
            .failed_rules
            .iter()
            .map(|(rule, e)| (rule.clone(), e.to_string()))
            .collect();
        self.emit(&config, outcome.notifications);

        self.snapshot_tx.send_replace(Arc::new(AlertsSnapshot {
            ticks: self.ticks,
            evaluated_at: Some(now),
            alerts: self.evaluator.snapshot(),
            rule_errors,
        }));
    }

    fn emit(&self, config: &AlertConfig, notifications: Vec<Notification>) {
        self.metrics.record_emitted(notifications.len() as u64);
        for notification in notifications {
            let targets = config.targets(&notification);
            if targets.is_empty() {
                tracing::debug!(rule = %notification.alert.rule, "No receivers for notification");
                continue;
            }
            self.dispatch.dispatch(notification, targets);
        }
    }
}

/// Ticks lost between two scheduled instants
fn skipped_ticks(gap: Duration, interval: Duration) -> u64 {
    if interval.is_zero() {
        return 0;
    }
    (gap.as_millis() / interval.as_millis()).saturating_sub(1) as u64
}

/// Running evaluation loop
pub struct EvaluationTask {
    handle: tokio::task::JoinHandle<()>,
    shutdown_tx: mpsc::Sender<()>,
}

impl EvaluationTask {
    /// Let the current tick finish, then stop
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Evaluation task failed");
        }
    }
}
