use crate::data::{is_valid_metric_name, Labels, MetricSample, Sample, METRIC_NAME_LABEL};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use super::series::{AppendResult, Series};

/// Default retention before any rule set has been applied (1 hour)
pub const DEFAULT_RETENTION_MS: i64 = 60 * 60 * 1000;

/// In-memory sample store keyed by metric name, then by label set
pub struct SeriesStore {
    /// Metric name -> (labels without `__name__`) -> series
    metrics: DashMap<String, DashMap<Labels, Series>>,
    /// How far back samples are kept, relative to the latest eviction time
    retention_ms: AtomicI64,
    samples_appended: AtomicU64,
    samples_rejected: AtomicU64,
    samples_evicted: AtomicU64,
}

/// Samples of one series inside an evaluation window
#[derive(Debug, Clone)]
pub struct SeriesWindow {
    /// Full series labels including `__name__`
    pub labels: Labels,
    pub samples: Vec<Sample>,
}

impl SeriesStore {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION_MS)
    }

    pub fn with_retention(retention_ms: i64) -> Self {
        Self {
            metrics: DashMap::new(),
            retention_ms: AtomicI64::new(retention_ms),
            samples_appended: AtomicU64::new(0),
            samples_rejected: AtomicU64::new(0),
            samples_evicted: AtomicU64::new(0),
        }
    }

    pub fn retention_ms(&self) -> i64 {
        self.retention_ms.load(Ordering::Relaxed)
    }

    pub fn set_retention_ms(&self, retention_ms: i64) {
        self.retention_ms.store(retention_ms.max(0), Ordering::Relaxed);
    }

    /// Record a single sample
    pub fn insert(&self, sample: MetricSample) -> Result<(), StorageError> {
        let result = self.append(sample);
        match &result {
            Ok(()) => self.samples_appended.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.samples_rejected.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    /// Record many samples; rejected samples are logged and skipped
    pub fn insert_batch(&self, samples: Vec<MetricSample>) -> usize {
        let mut inserted = 0;

        for sample in samples {
            match self.insert(sample) {
                Ok(()) => inserted += 1,
                Err(e) => {
                    tracing::debug!("Rejected sample: {}", e);
                }
            }
        }

        inserted
    }

    fn append(&self, sample: MetricSample) -> Result<(), StorageError> {
        if !is_valid_metric_name(&sample.name) {
            return Err(StorageError::InvalidMetricName(sample.name));
        }
        if sample.labels.get(METRIC_NAME_LABEL).is_some() {
            return Err(StorageError::ReservedLabel(sample.name));
        }

        let metric = self.metrics.entry(sample.name.clone()).or_default();
        let mut series = metric.entry(sample.labels.clone()).or_default();

        match series.push(Sample::new(sample.timestamp, sample.value)) {
            AppendResult::Appended | AppendResult::Replaced => Ok(()),
            AppendResult::OutOfOrder { newest } => Err(StorageError::OutOfOrder {
                series: sample.series_labels().to_string(),
                timestamp: sample.timestamp,
                newest,
            }),
        }
    }

    /// Whether any series exists for `name`
    pub fn has_metric(&self, name: &str) -> bool {
        self.metrics
            .get(name)
            .map(|series| !series.is_empty())
            .unwrap_or(false)
    }

    /// Collect `(start, end]` windows for every series of `name` whose labels
    /// satisfy `filter`. The filter sees the full label set including `__name__`.
    pub fn select<F>(&self, name: &str, start: i64, end: i64, filter: F) -> Vec<SeriesWindow>
    where
        F: Fn(&Labels) -> bool,
    {
        let Some(metric) = self.metrics.get(name) else {
            return Vec::new();
        };

        metric
            .iter()
            .filter_map(|entry| {
                let labels = entry.key().clone().with(METRIC_NAME_LABEL, name);
                if !filter(&labels) {
                    return None;
                }
                Some(SeriesWindow {
                    labels,
                    samples: entry.value().range(start, end),
                })
            })
            .collect()
    }

    /// Drop samples older than `now - retention`, then empty series and metrics.
    /// Returns the number of samples removed.
    pub fn evict_expired(&self, now: i64) -> usize {
        let cutoff = now - self.retention_ms();
        let mut removed = 0;

        self.metrics.retain(|_, metric| {
            metric.retain(|_, series| {
                removed += series.evict_before(cutoff);
                !series.is_empty()
            });
            !metric.is_empty()
        });

        self.samples_evicted
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.metrics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn stats(&self) -> StoreStats {
        let mut series_count = 0;
        let mut sample_count = 0;

        for metric in self.metrics.iter() {
            series_count += metric.len();
            sample_count += metric.iter().map(|s| s.len()).sum::<usize>();
        }

        StoreStats {
            metrics: self.metrics.len(),
            series: series_count,
            samples: sample_count,
            retention_ms: self.retention_ms(),
            samples_appended: self.samples_appended.load(Ordering::Relaxed),
            samples_rejected: self.samples_rejected.load(Ordering::Relaxed),
            samples_evicted: self.samples_evicted.load(Ordering::Relaxed),
        }
    }
}

impl Default for SeriesStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub metrics: usize,
    pub series: usize,
    pub samples: usize,
    pub retention_ms: i64,
    pub samples_appended: u64,
    pub samples_rejected: u64,
    pub samples_evicted: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Invalid metric name: '{0}'")]
    InvalidMetricName(String),

    #[error("Sample for '{0}' uses reserved label __name__")]
    ReservedLabel(String),

    #[error("Out-of-order sample for {series}: timestamp {timestamp} is older than {newest}")]
    OutOfOrder {
        series: String,
        timestamp: i64,
        newest: i64,
    },
}
