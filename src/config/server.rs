use std::path::PathBuf;
use std::time::Duration;

use crate::ingest::ScrapeTarget;
use crate::notify::{DispatcherConfig, RetryPolicy};

/// Process configuration, read from `KLAXON_*` environment variables
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub rules_file: PathBuf,
    pub eval_interval: Duration,
    pub dispatcher: DispatcherConfig,
    pub scrape_targets: Vec<ScrapeTarget>,
    pub scrape_interval: Duration,
    /// Environment prefix for receiver secrets
    pub secret_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9093,
            rules_file: PathBuf::from("rules.yml"),
            eval_interval: Duration::from_secs(15),
            dispatcher: DispatcherConfig::default(),
            scrape_targets: Vec::new(),
            scrape_interval: Duration::from_secs(15),
            secret_prefix: "KLAXON_SECRET_".to_string(),
        }
    }
}

impl ServerConfig {
    /// KLAXON_HOST=0.0.0.0
    /// KLAXON_PORT=9093
    /// KLAXON_RULES_FILE=rules.yml
    /// KLAXON_SCRAPE_TARGETS=node=http://10.0.0.2:9100/metrics,http://10.0.0.3:9100/metrics
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup; unparsable values fall back
    /// to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };

        let retry = RetryPolicy {
            max_attempts: number("KLAXON_MAX_ATTEMPTS", 5).max(1) as u32,
            base: Duration::from_millis(number("KLAXON_BACKOFF_BASE_MS", 500)),
            max_backoff: Duration::from_millis(number("KLAXON_BACKOFF_MAX_MS", 30_000)),
            jitter: true,
        };

        let dispatcher = DispatcherConfig {
            workers: number("KLAXON_DELIVERY_WORKERS", 8).max(1) as usize,
            queue_capacity: number("KLAXON_DELIVERY_QUEUE", 1024).max(1) as usize,
            retry,
            attempt_timeout: Duration::from_secs(number("KLAXON_DELIVERY_TIMEOUT_SECS", 10).max(1)),
            shutdown_grace: Duration::from_secs(number("KLAXON_SHUTDOWN_GRACE_SECS", 10)),
        };

        let scrape_targets = lookup("KLAXON_SCRAPE_TARGETS")
            .map(|s| s.split(',').filter_map(ScrapeTarget::parse).collect())
            .unwrap_or_default();

        Self {
            host: lookup("KLAXON_HOST").unwrap_or(defaults.host),
            port: lookup("KLAXON_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            rules_file: lookup("KLAXON_RULES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.rules_file),
            eval_interval: Duration::from_secs(number("KLAXON_EVAL_INTERVAL_SECS", 15).max(1)),
            dispatcher,
            scrape_targets,
            scrape_interval: Duration::from_secs(number("KLAXON_SCRAPE_INTERVAL_SECS", 15).max(1)),
            secret_prefix: lookup("KLAXON_SECRET_PREFIX").unwrap_or(defaults.secret_prefix),
        }
    }

    pub fn log_summary(&self) {
        tracing::info!("Klaxon configuration:");
        tracing::info!("  Listen: {}:{}", self.host, self.port);
        tracing::info!("  Rules file: {}", self.rules_file.display());
        tracing::info!("  Evaluation interval: {}s", self.eval_interval.as_secs());
        tracing::info!(
            "  Delivery: {} workers, queue {}, {} attempts, backoff {}ms..{}ms",
            self.dispatcher.workers,
            self.dispatcher.queue_capacity,
            self.dispatcher.retry.max_attempts,
            self.dispatcher.retry.base.as_millis(),
            self.dispatcher.retry.max_backoff.as_millis()
        );
        if self.scrape_targets.is_empty() {
            tracing::info!("  Scraper: DISABLED (push ingestion only)");
        } else {
            tracing::info!(
                "  Scraper: {} targets every {}s",
                self.scrape_targets.len(),
                self.scrape_interval.as_secs()
            );
            for target in &self.scrape_targets {
                tracing::info!("    - {} @ {}", target.job, target.url);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[]));
        assert_eq!(config.port, 9093);
        assert_eq!(config.eval_interval, Duration::from_secs(15));
        assert_eq!(config.dispatcher.workers, 8);
        assert_eq!(config.dispatcher.retry.max_attempts, 5);
        assert!(config.scrape_targets.is_empty());
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("KLAXON_PORT", "9999"),
            ("KLAXON_EVAL_INTERVAL_SECS", "30"),
            ("KLAXON_DELIVERY_WORKERS", "0"),
            ("KLAXON_BACKOFF_BASE_MS", "not-a-number"),
            ("KLAXON_SCRAPE_TARGETS", "node=http://10.0.0.2:9100/metrics, ,http://10.0.0.3:9100/metrics"),
        ]));
        assert_eq!(config.port, 9999);
        assert_eq!(config.eval_interval, Duration::from_secs(30));
        assert_eq!(config.dispatcher.workers, 1);
        assert_eq!(config.dispatcher.retry.base, Duration::from_millis(500));
        assert_eq!(config.scrape_targets.len(), 2);
        assert_eq!(config.scrape_targets[0].job, "node");
    }
}
