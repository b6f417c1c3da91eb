//! Klaxon: Metrics-Driven Alert Evaluator
//!
//! Samples pushed over HTTP (or scraped from exposition endpoints) are kept in
//! a bounded in-memory series store. A single evaluation loop checks windowed
//! threshold rules against it on a fixed tick, drives every alert instance
//! through Pending, Firing and Resolved, and hands notifications to a routing
//! tree that fans them out to webhook, pager, email and log receivers.
//!
//! # Features
//!
//! - **Threshold Rules**: `avg(rate(http_errors_total[5m])) by (service) > 0.05`
//! - **Hold Durations**: Conditions must stay true for `for` before firing
//! - **Routing Tree**: First-match label routing with `continue` fan-out
//! - **Retries**: Bounded exponential backoff per receiver, failures counted
//! - **Hot Reload**: Invalid rule files are rejected as a whole
//!
//! # Example
//!
//! ```no_run
//! use klaxon::alerts::AlertEvaluator;
//! use klaxon::config::parse_config;
//! use klaxon::data::{Labels, MetricSample};
//! use klaxon::notify::StaticSecretStore;
//! use klaxon::storage::SeriesStore;
//! use std::time::Duration;
//!
//! let config = parse_config(
//!     r#"
//! rules:
//!   - name: HighCpu
//!     expr: cpu_usage > 90
//!     for: 1m
//! route:
//!   receivers: [ops]
//! receivers:
//!   - name: ops
//!     type: log
//! "#,
//!     &StaticSecretStore::new(),
//!     Duration::from_secs(10),
//! )
//! .unwrap();
//!
//! let store = SeriesStore::new();
//! let labels = Labels::from_pairs([("host", "web-1")]);
//! store
//!     .insert(MetricSample::new("cpu_usage", labels, 97.0, 1_000))
//!     .unwrap();
//!
//! let mut evaluator = AlertEvaluator::new();
//! let outcome = evaluator.evaluate(&config.rules, &config.router, &store, 1_000);
//! println!("Pending: {}, notifications: {}", evaluator.len(), outcome.notifications.len());
//! ```

pub mod alerts;
pub mod api;
pub mod config;
pub mod data;
pub mod ingest;
pub mod metrics;
pub mod notify;
pub mod rules;
pub mod storage;

// Re-export commonly used types
pub use alerts::{AlertEvaluator, AlertInstance, AlertState};
pub use config::{AlertConfig, ConfigError, ServerConfig};
pub use data::{Labels, MetricSample};
pub use storage::{SeriesStore, StorageError};
