//! Alert state machine driver
//!
//! Each tick, every rule is evaluated against the store and the instance
//! table is advanced:
//!
//! ```text
//! (no instance) --match--> Pending --held for `for`--> Firing
//!        ^                    |                          |
//!        +-------- no match --+------ no match (resolved notification)
//! ```
//!
//! With `for = 0` a new match goes straight to Firing. The evaluator is
//! owned by a single task; nothing else mutates the instance table.

use std::collections::{BTreeMap, HashSet};

use super::instance::{AlertInstance, AlertState, InstanceKey};
use super::template::render_all;
use crate::data::Labels;
use crate::notify::{Notification, RoutingTree};
use crate::rules::{duration_millis, AlertRule, EvalContext, ExprError};
use crate::storage::SeriesStore;

/// Result of one evaluation tick
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// Firing and resolved transitions, in emission order
    pub notifications: Vec<Notification>,
    pub rules_evaluated: usize,
    /// Rules skipped this tick because their expression failed
    pub failed_rules: Vec<(String, ExprError)>,
}

#[derive(Debug, Default)]
pub struct AlertEvaluator {
    instances: BTreeMap<InstanceKey, AlertInstance>,
}

impl AlertEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate every rule at `now` (unix millis)
    pub fn evaluate(
        &mut self,
        rules: &[AlertRule],
        router: &RoutingTree,
        store: &SeriesStore,
        now: i64,
    ) -> TickOutcome {
        let ctx = EvalContext::new(store, now);
        let mut outcome = TickOutcome::default();

        for rule in rules {
            match ctx.evaluate(&rule.expr) {
                Ok(elements) => {
                    outcome.rules_evaluated += 1;
                    let matched = elements.into_iter().map(|e| (e.labels, e.value));
                    self.advance(rule, matched, router, now, &mut outcome.notifications);
                }
                Err(e) => {
                    tracing::warn!(rule = %rule.name, error = %e, "Rule evaluation failed, skipping");
                    outcome.failed_rules.push((rule.name.clone(), e));
                }
            }
        }

        outcome
    }

    fn advance(
        &mut self,
        rule: &AlertRule,
        matched: impl Iterator<Item = (Labels, f64)>,
        router: &RoutingTree,
        now: i64,
        notifications: &mut Vec<Notification>,
    ) {
        let for_millis = rule.for_millis();
        let mut seen = HashSet::new();

        for (series, value) in matched {
            let key = InstanceKey::new(rule.name.clone(), series);
            let labels = rule.alert_labels(&key.labels);
            let annotations = render_all(&rule.annotations, &rule.name, &labels, value);

            match self.instances.get_mut(&key) {
                Some(instance) => {
                    instance.value = value;
                    instance.annotations = annotations;
                    instance.labels = labels;
                    instance.last_evaluated_at = now;

                    match instance.state {
                        AlertState::Pending if now - instance.active_at >= for_millis => {
                            instance.state = AlertState::Firing;
                            instance.fired_at = Some(now);
                            instance.last_notified_at = Some(now);
                            tracing::info!(rule = %rule.name, labels = %instance.labels, "Alert firing");
                            notifications.push(Notification::firing(instance, now, false));
                        }
                        AlertState::Firing => {
                            let due = router.repeat_interval(&instance.labels).is_some_and(|interval| {
                                instance
                                    .last_notified_at
                                    .map_or(true, |last| now - last >= duration_millis(interval))
                            });
                            if due {
                                instance.last_notified_at = Some(now);
                                notifications.push(Notification::firing(instance, now, true));
                            }
                        }
                        _ => {}
                    }
                }
                None => {
                    let mut instance = AlertInstance {
                        rule: rule.name.clone(),
                        labels,
                        annotations,
                        state: AlertState::Pending,
                        value,
                        active_at: now,
                        fired_at: None,
                        last_evaluated_at: now,
                        last_notified_at: None,
                    };
                    if for_millis == 0 {
                        instance.state = AlertState::Firing;
                        instance.fired_at = Some(now);
                        instance.last_notified_at = Some(now);
                        tracing::info!(rule = %rule.name, labels = %instance.labels, "Alert firing");
                        notifications.push(Notification::firing(&instance, now, false));
                    } else {
                        tracing::debug!(rule = %rule.name, labels = %instance.labels, "Alert pending");
                    }
                    self.instances.insert(key.clone(), instance);
                }
            }

            seen.insert(key);
        }

        self.instances.retain(|key, instance| {
            if key.rule != rule.name || seen.contains(key) {
                return true;
            }
            if instance.is_firing() {
                tracing::info!(rule = %rule.name, labels = %instance.labels, "Alert resolved");
                notifications.push(Notification::resolved(instance, now));
            }
            false
        });
    }

    /// Drop instances of rules that are no longer configured, resolving the
    /// firing ones
    pub fn reconcile(&mut self, rules: &[AlertRule], now: i64) -> Vec<Notification> {
        let names: HashSet<&str> = rules.iter().map(|r| r.name.as_str()).collect();
        let mut notifications = Vec::new();

        self.instances.retain(|key, instance| {
            if names.contains(key.rule.as_str()) {
                return true;
            }
            if instance.is_firing() {
                notifications.push(Notification::resolved(instance, now));
            }
            false
        });

        notifications
    }

    pub fn instances(&self) -> impl Iterator<Item = &AlertInstance> {
        self.instances.values()
    }

    /// Copy of the instance table, ordered by rule then labels
    pub fn snapshot(&self) -> Vec<AlertInstance> {
        self.instances.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
