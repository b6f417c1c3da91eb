//! Rule file: alert rules, routing tree and receivers
//!
//! ```yaml
//! rules:
//!   - name: HighErrorRate
//!     expr: 'rate(http_errors_total{job="api"}[5m]) > 0.05'
//!     for: 5m
//!     severity: critical
//!     annotations:
//!       summary: '{{ $labels.job }} error rate is {{ $value }}'
//! route:
//!   receivers: [default]
//!   routes:
//!     - matchers: ['severity="critical"']
//!       receivers: [oncall]
//! receivers:
//!   - name: default
//!     type: log
//!   - name: oncall
//!     type: pager
//!     routing_key_secret: pager-routing-key
//! ```
//!
//! A file is validated as a whole; any error rejects all of it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::data::Labels;
use crate::notify::dispatcher::Target;
use crate::notify::{build_receiver, Notification, NotifyError, Receiver, ReceiverSpec, Route, RoutingTree, SecretStore};
use crate::rules::duration::serde_literal;
use crate::rules::{parse_expr, parse_matcher, AlertRule, ExprError, DEFAULT_LOOKBACK};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed rule file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Rule name must not be empty")]
    EmptyRuleName,

    #[error("Duplicate rule: {0}")]
    DuplicateRule(String),

    #[error("Rule '{rule}' has an invalid expression: {source}")]
    InvalidExpr { rule: String, source: ExprError },

    #[error("Invalid route matcher '{matcher}': {source}")]
    InvalidMatcher { matcher: String, source: ExprError },

    #[error("Route matching [{0}] has neither receivers nor child routes")]
    EmptyRoute(String),

    #[error("Root route must name at least one default receiver")]
    NoDefaultReceiver,

    #[error("Duplicate receiver: {0}")]
    DuplicateReceiver(String),

    #[error("Route references unknown receiver: {0}")]
    UnknownReceiver(String),

    #[error("Receiver '{0}' has a zero repeat_interval")]
    ZeroRepeatInterval(String),

    #[error(transparent)]
    Receiver(#[from] NotifyError),

    #[error("Reload task failed: {0}")]
    ReloadTask(String),
}

/// On-disk layout
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleFile {
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    pub route: RouteSpec,
    pub receivers: Vec<ReceiverSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    pub name: String,
    pub expr: String,
    #[serde(rename = "for", default, with = "serde_literal::option")]
    pub for_duration: Option<Duration>,
    #[serde(default = "default_severity")]
    pub severity: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

fn default_severity() -> String {
    "warning".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteSpec {
    /// Matcher strings such as `severity="critical"`; empty matches all
    #[serde(default, alias = "match")]
    pub matchers: Vec<String>,
    #[serde(default)]
    pub receivers: Vec<String>,
    #[serde(default, rename = "continue")]
    pub continue_matching: bool,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
}

/// A validated, ready-to-use configuration
pub struct AlertConfig {
    pub rules: Vec<AlertRule>,
    pub router: RoutingTree,
    pub receivers: HashMap<String, Arc<dyn Receiver>>,
    /// Unix millis
    pub loaded_at: i64,
}

impl AlertConfig {
    pub fn new(
        rules: Vec<AlertRule>,
        router: RoutingTree,
        receivers: HashMap<String, Arc<dyn Receiver>>,
    ) -> Self {
        Self {
            rules,
            router,
            receivers,
            loaded_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Configuration with no rules that sends everything to `receiver`
    pub fn empty(name: &str, receiver: Arc<dyn Receiver>) -> Self {
        Self::new(
            Vec::new(),
            RoutingTree::catch_all(vec![name.to_string()]),
            HashMap::from([(name.to_string(), receiver)]),
        )
    }

    /// History the store must keep for every rule to evaluate
    pub fn retention(&self) -> Duration {
        self.rules
            .iter()
            .map(AlertRule::required_history)
            .max()
            .unwrap_or(DEFAULT_LOOKBACK)
            .max(DEFAULT_LOOKBACK)
    }

    /// Delivery targets for a notification
    pub fn targets(&self, notification: &Notification) -> Vec<Target> {
        self.router
            .route_notification(notification)
            .into_iter()
            .filter_map(|name| {
                let receiver = self.receivers.get(&name)?;
                Some(Target::new(name, Arc::clone(receiver)))
            })
            .collect()
    }

    pub fn receiver_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.receivers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Read and validate a rule file
pub fn load_config(
    path: &Path,
    secrets: &dyn SecretStore,
    timeout: Duration,
) -> Result<AlertConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&text, secrets, timeout)
}

/// Parse and validate rule file text
pub fn parse_config(
    text: &str,
    secrets: &dyn SecretStore,
    timeout: Duration,
) -> Result<AlertConfig, ConfigError> {
    let file: RuleFile = serde_yaml::from_str(text)?;

    let rules = build_rules(&file.rules)?;

    let mut receiver_names = HashSet::new();
    for spec in &file.receivers {
        if !receiver_names.insert(spec.name.as_str()) {
            return Err(ConfigError::DuplicateReceiver(spec.name.clone()));
        }
    }

    if file.route.receivers.is_empty() {
        return Err(ConfigError::NoDefaultReceiver);
    }
    let root = build_route(&file.route)?;

    let referenced: HashSet<&str> = root.referenced_receivers().into_iter().collect();
    for name in &referenced {
        if !receiver_names.contains(name) {
            return Err(ConfigError::UnknownReceiver(name.to_string()));
        }
    }

    let mut repeat_intervals = HashMap::new();
    let mut receivers = HashMap::new();
    for spec in &file.receivers {
        if let Some(interval) = spec.repeat_interval {
            if interval.is_zero() {
                return Err(ConfigError::ZeroRepeatInterval(spec.name.clone()));
            }
            repeat_intervals.insert(spec.name.clone(), interval);
        }
        if !referenced.contains(spec.name.as_str()) {
            tracing::warn!(receiver = %spec.name, "Receiver is not referenced by any route");
        }
        receivers.insert(spec.name.clone(), build_receiver(spec, secrets, timeout)?);
    }

    Ok(AlertConfig::new(
        rules,
        RoutingTree::new(root, repeat_intervals),
        receivers,
    ))
}

fn build_rules(specs: &[RuleSpec]) -> Result<Vec<AlertRule>, ConfigError> {
    let mut names = HashSet::new();
    let mut rules = Vec::with_capacity(specs.len());

    for spec in specs {
        let name = spec.name.trim();
        if name.is_empty() {
            return Err(ConfigError::EmptyRuleName);
        }
        if !names.insert(name.to_string()) {
            return Err(ConfigError::DuplicateRule(name.to_string()));
        }

        let expr = parse_expr(&spec.expr).map_err(|source| ConfigError::InvalidExpr {
            rule: name.to_string(),
            source,
        })?;

        let mut rule = AlertRule::new(name, expr)
            .with_for(spec.for_duration.unwrap_or(Duration::ZERO))
            .with_severity(spec.severity.clone());
        rule.labels = Labels::from(spec.labels.clone());
        rule.annotations = spec.annotations.clone();
        rules.push(rule);
    }

    Ok(rules)
}

fn build_route(spec: &RouteSpec) -> Result<Route, ConfigError> {
    if spec.receivers.is_empty() && spec.routes.is_empty() {
        return Err(ConfigError::EmptyRoute(spec.matchers.join(", ")));
    }

    let mut route = Route::new(spec.receivers.clone());
    for text in &spec.matchers {
        let matcher = parse_matcher(text).map_err(|source| ConfigError::InvalidMatcher {
            matcher: text.clone(),
            source,
        })?;
        route = route.with_matcher(matcher);
    }
    if spec.continue_matching {
        route = route.with_continue();
    }
    for child in &spec.routes {
        route = route.with_child(build_route(child)?);
    }
    Ok(route)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertInstance, AlertState};
    use crate::notify::StaticSecretStore;

    const TIMEOUT: Duration = Duration::from_secs(5);

    const SAMPLE: &str = r#"
rules:
  - name: HighErrorRate
    expr: 'rate(http_errors_total{job="api"}[10m]) > 0.05'
    for: 5m
    severity: critical
    labels:
      team: payments
    annotations:
      summary: '{{ $labels.job }} error rate is {{ $value }}'
  - name: InstanceDown
    expr: up == 0
route:
  receivers: [default]
  routes:
    - matchers: ['severity="critical"']
      receivers: [oncall]
      continue: true
    - match: ['team=~"pay.*"']
      receivers: [chat]
receivers:
  - name: default
    type: log
  - name: oncall
    type: pager
    routing_key_secret: pager-key
  - name: chat
    type: webhook
    url_secret: chat-url
    repeat_interval: 4h
"#;

    fn secrets() -> StaticSecretStore {
        StaticSecretStore::new()
            .with("pager-key", "R0UT1NG")
            .with("chat-url", "https://chat.example.com/hooks/T0K3N")
    }

    fn instance(labels: Labels) -> AlertInstance {
        AlertInstance {
            rule: "HighErrorRate".to_string(),
            labels,
            annotations: BTreeMap::new(),
            state: AlertState::Firing,
            value: 1.0,
            active_at: 0,
            fired_at: Some(0),
            last_evaluated_at: 0,
            last_notified_at: None,
        }
    }

    #[test]
    fn test_parse_valid_file() {
        let config = parse_config(SAMPLE, &secrets(), TIMEOUT).unwrap();

        assert_eq!(config.rules.len(), 2);
        let rule = &config.rules[0];
        assert_eq!(rule.for_duration, Duration::from_secs(300));
        assert_eq!(rule.severity, "critical");
        assert_eq!(rule.labels.get("team"), Some("payments"));
        assert_eq!(config.rules[1].severity, "warning");
        assert_eq!(config.rules[1].for_duration, Duration::ZERO);

        assert_eq!(config.receiver_names(), vec!["chat", "default", "oncall"]);
        assert_eq!(config.retention(), Duration::from_secs(600));
    }

    #[test]
    fn test_targets_follow_routing() {
        let config = parse_config(SAMPLE, &secrets(), TIMEOUT).unwrap();

        let critical = Labels::from_pairs([("severity", "critical"), ("team", "payments")]);
        let firing = Notification::firing(&instance(critical.clone()), 0, false);
        let names: Vec<_> = config.targets(&firing).into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["oncall", "chat"]);

        // Only the receiver with a repeat interval gets re-sends
        let repeat = Notification::firing(&instance(critical), 0, true);
        let names: Vec<_> = config.targets(&repeat).into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["chat"]);

        let other = Notification::firing(&instance(Labels::from_pairs([("severity", "info")])), 0, false);
        let names: Vec<_> = config.targets(&other).into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["default"]);
    }

    fn rejects(text: &str) -> ConfigError {
        match parse_config(text, &secrets(), TIMEOUT) {
            Ok(_) => panic!("configuration should be rejected"),
            Err(e) => e,
        }
    }

    #[test]
    fn test_invalid_expression_rejects_file() {
        let text = SAMPLE.replace("up == 0", "up = = 0");
        assert!(matches!(rejects(&text), ConfigError::InvalidExpr { ref rule, .. } if rule == "InstanceDown"));
    }

    #[test]
    fn test_duplicate_rule_rejected() {
        let text = SAMPLE.replace("InstanceDown", "HighErrorRate");
        assert!(matches!(rejects(&text), ConfigError::DuplicateRule(_)));
    }

    #[test]
    fn test_unknown_receiver_rejected() {
        let text = SAMPLE.replace("receivers: [chat]", "receivers: [slack]");
        assert!(matches!(rejects(&text), ConfigError::UnknownReceiver(ref r) if r == "slack"));
    }

    #[test]
    fn test_missing_secret_rejected() {
        let result = parse_config(SAMPLE, &StaticSecretStore::new().with("pager-key", "x"), TIMEOUT);
        assert!(matches!(
            result,
            Err(ConfigError::Receiver(NotifyError::MissingSecret { .. }))
        ));
    }

    #[test]
    fn test_structural_errors() {
        let no_default = "route:\n  receivers: []\nreceivers: []\n";
        assert!(matches!(rejects(no_default), ConfigError::NoDefaultReceiver));

        let unknown_field = SAMPLE.replace("severity: critical\n    labels", "severity: critical\n    sevrity: x\n    labels");
        assert!(matches!(rejects(&unknown_field), ConfigError::Yaml(_)));

        let bad_matcher = SAMPLE.replace(r#"'severity="critical"'"#, "'severity'");
        assert!(matches!(rejects(&bad_matcher), ConfigError::InvalidMatcher { .. }));

        let bad_for = SAMPLE.replace("for: 5m", "for: 5 minutes");
        assert!(matches!(rejects(&bad_for), ConfigError::Yaml(_)));
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        let huge_for = SAMPLE.replace("for: 5m", "for: 20000000000w");
        assert!(matches!(rejects(&huge_for), ConfigError::Yaml(_)));

        let huge_repeat = SAMPLE.replace("repeat_interval: 4h", "repeat_interval: 20000000000w");
        assert!(matches!(rejects(&huge_repeat), ConfigError::Yaml(_)));
    }

    #[test]
    fn test_receiver_typo_rejects_file() {
        let typo = SAMPLE.replace("repeat_interval: 4h", "repeat_intervall: 4h");
        match rejects(&typo) {
            ConfigError::Yaml(e) => assert!(e.to_string().contains("repeat_intervall")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.yml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = load_config(&path, &secrets(), TIMEOUT).unwrap();
        assert_eq!(config.rules.len(), 2);

        let missing = load_config(&dir.path().join("absent.yml"), &secrets(), TIMEOUT);
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
