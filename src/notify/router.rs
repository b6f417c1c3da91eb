//! Routing tree
//!
//! Routes are checked in order and the first match wins, like a firewall
//! rule list. A route with `continue_matching` lets later siblings match too.
//! Child routes refine their parent; when no child matches, the parent's own
//! receivers are used.

use std::collections::HashMap;
use std::time::Duration;

use super::notification::Notification;
use crate::data::Labels;
use crate::rules::{matches_all, LabelMatcher};

#[derive(Debug, Clone, Default)]
pub struct Route {
    pub matchers: Vec<LabelMatcher>,
    pub receivers: Vec<String>,
    pub continue_matching: bool,
    pub routes: Vec<Route>,
}

impl Route {
    pub fn new(receivers: Vec<String>) -> Self {
        Self {
            receivers,
            ..Self::default()
        }
    }

    pub fn with_matcher(mut self, matcher: LabelMatcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn with_continue(mut self) -> Self {
        self.continue_matching = true;
        self
    }

    pub fn with_child(mut self, child: Route) -> Self {
        self.routes.push(child);
        self
    }

    /// Append receivers for `labels`. Returns false if this route did not match.
    fn collect(&self, labels: &Labels, out: &mut Vec<String>) -> bool {
        if !matches_all(&self.matchers, labels) {
            return false;
        }

        let mut child_matched = false;
        for child in &self.routes {
            if child.collect(labels, out) {
                child_matched = true;
                if !child.continue_matching {
                    break;
                }
            }
        }

        if !child_matched {
            out.extend(self.receivers.iter().cloned());
        }
        true
    }

    /// Every receiver name referenced anywhere in this subtree
    pub fn referenced_receivers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.receivers.iter().map(String::as_str).collect();
        for child in &self.routes {
            names.extend(child.referenced_receivers());
        }
        names
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoutingTree {
    root: Route,
    /// Re-send interval configured per receiver
    repeat_intervals: HashMap<String, Duration>,
}

impl RoutingTree {
    /// The root matches everything; its receivers are the default
    pub fn new(mut root: Route, repeat_intervals: HashMap<String, Duration>) -> Self {
        root.matchers.clear();
        Self {
            root,
            repeat_intervals,
        }
    }

    /// Tree that sends everything to `receivers`
    pub fn catch_all(receivers: Vec<String>) -> Self {
        Self::new(Route::new(receivers), HashMap::new())
    }

    pub fn root(&self) -> &Route {
        &self.root
    }

    /// Receivers for an alert label set, in match order without duplicates
    pub fn route(&self, labels: &Labels) -> Vec<String> {
        let mut out = Vec::new();
        self.root.collect(labels, &mut out);

        let mut seen = std::collections::HashSet::new();
        out.retain(|name| seen.insert(name.clone()));
        out
    }

    /// Receivers for a notification. Re-sends only go to receivers that
    /// configure a repeat interval.
    pub fn route_notification(&self, notification: &Notification) -> Vec<String> {
        let receivers = self.route(&notification.alert.labels);
        if notification.repeat {
            receivers
                .into_iter()
                .filter(|r| self.repeat_intervals.contains_key(r))
                .collect()
        } else {
            receivers
        }
    }

    /// Shortest repeat interval among the receivers an alert routes to
    pub fn repeat_interval(&self, labels: &Labels) -> Option<Duration> {
        self.route(labels)
            .iter()
            .filter_map(|r| self.repeat_intervals.get(r).copied())
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{LabelMatcher, MatchOp};

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn tree() -> RoutingTree {
        let root = Route::new(names(&["default"]))
            .with_child(
                Route::new(names(&["pager", "chat"]))
                    .with_matcher(LabelMatcher::equal("severity", "critical")),
            )
            .with_child(
                Route::new(names(&["db-team"]))
                    .with_matcher(LabelMatcher::new("team", MatchOp::Regex, "db|storage").unwrap())
                    .with_continue(),
            )
            .with_child(
                Route::new(names(&["chat"])).with_matcher(LabelMatcher::equal("severity", "warning")),
            );

        RoutingTree::new(
            root,
            HashMap::from([("pager".to_string(), Duration::from_secs(3600))]),
        )
    }

    #[test]
    fn test_first_match_wins() {
        let labels = Labels::from_pairs([("severity", "critical"), ("team", "db")]);
        // critical matches first and does not continue, so db-team is skipped
        assert_eq!(tree().route(&labels), names(&["pager", "chat"]));
    }

    #[test]
    fn test_continue_allows_later_matches() {
        let labels = Labels::from_pairs([("severity", "warning"), ("team", "storage")]);
        assert_eq!(tree().route(&labels), names(&["db-team", "chat"]));
    }

    #[test]
    fn test_fallback_to_default() {
        let labels = Labels::from_pairs([("severity", "info")]);
        assert_eq!(tree().route(&labels), names(&["default"]));
    }

    #[test]
    fn test_nested_routes_refine_parent() {
        let root = Route::new(names(&["default"])).with_child(
            Route::new(names(&["api-oncall"]))
                .with_matcher(LabelMatcher::equal("job", "api"))
                .with_child(
                    Route::new(names(&["api-pager"]))
                        .with_matcher(LabelMatcher::equal("severity", "critical")),
                ),
        );
        let tree = RoutingTree::new(root, HashMap::new());

        let critical = Labels::from_pairs([("job", "api"), ("severity", "critical")]);
        assert_eq!(tree.route(&critical), names(&["api-pager"]));

        let warning = Labels::from_pairs([("job", "api"), ("severity", "warning")]);
        assert_eq!(tree.route(&warning), names(&["api-oncall"]));
    }

    #[test]
    fn test_catch_all() {
        let tree = RoutingTree::catch_all(names(&["log"]));
        assert_eq!(tree.route(&Labels::new()), names(&["log"]));
        assert_eq!(tree.repeat_interval(&Labels::new()), None);
    }

    #[test]
    fn test_repeat_interval_lookup() {
        let t = tree();
        let critical = Labels::from_pairs([("severity", "critical")]);
        assert_eq!(t.repeat_interval(&critical), Some(Duration::from_secs(3600)));
        assert_eq!(t.repeat_interval(&Labels::new()), None);
    }
}
