use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time;

use super::exposition::parse_exposition;
use crate::data::{Labels, MetricSample};
use crate::storage::SeriesStore;

/// Health sample recorded per target after each scrape
pub const UP_METRIC: &str = "up";

/// A metrics endpoint to pull from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeTarget {
    pub job: String,
    pub url: String,
}

impl ScrapeTarget {
    pub fn new(job: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            url: url.into(),
        }
    }

    /// Parse `job=url` or a bare `url` (job defaults to "scrape")
    pub fn parse(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return None;
        }
        match spec.split_once('=') {
            Some((job, url)) if !job.contains('/') && !job.is_empty() => {
                Some(Self::new(job.trim(), url.trim()))
            }
            _ => Some(Self::new("scrape", spec)),
        }
    }

    /// `host:port` of the target, used as the `instance` label
    pub fn instance(&self) -> String {
        reqwest::Url::parse(&self.url)
            .ok()
            .and_then(|u| {
                u.host_str().map(|h| match u.port_or_known_default() {
                    Some(p) => format!("{}:{}", h, p),
                    None => h.to_string(),
                })
            })
            .unwrap_or_else(|| self.url.clone())
    }

    fn target_labels(&self) -> Labels {
        Labels::from_pairs([("job", self.job.clone()), ("instance", self.instance())])
    }
}

/// Pull scraper feeding the series store at a fixed interval
pub struct Scraper {
    store: Arc<SeriesStore>,
    targets: Vec<ScrapeTarget>,
    interval: Duration,
    client: reqwest::Client,
    running: Arc<AtomicBool>,
}

impl Scraper {
    pub fn new(
        store: Arc<SeriesStore>,
        targets: Vec<ScrapeTarget>,
        interval: Duration,
    ) -> Result<Self, reqwest::Error> {
        // A scrape must finish before the next one is due
        let client = reqwest::Client::builder().timeout(interval).build()?;
        Ok(Self {
            store,
            targets,
            interval,
            client,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Start the background worker
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            tracing::info!(
                "Scraper started with {} targets, interval {:?}",
                self.targets.len(),
                self.interval
            );

            let mut interval = time::interval(self.interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

            while self.running.load(Ordering::SeqCst) {
                interval.tick().await;
                self.scrape_all().await;
            }

            tracing::info!("Scraper stopped");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Scrape every target once, concurrently
    pub async fn scrape_all(&self) -> usize {
        let now = chrono::Utc::now().timestamp_millis();
        let results = join_all(self.targets.iter().map(|t| self.scrape_target(t, now))).await;
        results.into_iter().sum()
    }

    async fn scrape_target(&self, target: &ScrapeTarget, now: i64) -> usize {
        let base = target.target_labels();

        let (up, inserted) = match self.fetch(target, now).await {
            Ok(samples) => {
                let samples = samples
                    .into_iter()
                    .map(|mut s| {
                        s.labels.merge(&base);
                        s
                    })
                    .collect();
                (1.0, self.store.insert_batch(samples))
            }
            Err(e) => {
                tracing::warn!(url = %target.url, error = %e, "Scrape failed");
                (0.0, 0)
            }
        };

        if let Err(e) = self
            .store
            .insert(MetricSample::new(UP_METRIC, base, up, now))
        {
            tracing::debug!(url = %target.url, error = %e, "Failed to record up sample");
        }

        inserted
    }

    async fn fetch(&self, target: &ScrapeTarget, now: i64) -> Result<Vec<MetricSample>, ScrapeError> {
        let response = self.client.get(&target.url).send().await?;
        if !response.status().is_success() {
            return Err(ScrapeError::Status(response.status().as_u16()));
        }
        let body = response.text().await?;
        Ok(parse_exposition(&body, now)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Target returned status {0}")]
    Status(u16),

    #[error(transparent)]
    Parse(#[from] super::exposition::ParseError),
}
