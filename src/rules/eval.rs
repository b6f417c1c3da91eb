//! Expression evaluation against the series store

use std::collections::HashMap;
use std::time::Duration;

use super::duration::{duration_millis, format_duration};
use super::expr::{AggregateOp, AlertExpr, RangeFunc, Selector, VectorExpr};
use super::matcher::matches_all;
use super::ExprError;
use crate::data::{Labels, Sample};
use crate::storage::SeriesStore;

/// How far back an instant selector looks for the latest sample
pub const DEFAULT_LOOKBACK: Duration = Duration::from_secs(5 * 60);

/// One output element of a vector expression
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub labels: Labels,
    pub value: f64,
}

/// Evaluation context for a single tick
pub struct EvalContext<'a> {
    pub store: &'a SeriesStore,
    /// Evaluation time, unix millis
    pub time: i64,
    pub lookback: Duration,
}

impl<'a> EvalContext<'a> {
    pub fn new(store: &'a SeriesStore, time: i64) -> Self {
        Self {
            store,
            time,
            lookback: DEFAULT_LOOKBACK,
        }
    }

    /// Elements that satisfy the comparison, with `__name__` removed
    pub fn evaluate(&self, expr: &AlertExpr) -> Result<Vec<Element>, ExprError> {
        let elements = self.vector(&expr.vector)?;
        Ok(elements
            .into_iter()
            .filter(|e| expr.op.apply(e.value, expr.threshold))
            .map(|mut e| {
                e.labels = e.labels.without_name();
                e
            })
            .collect())
    }

    fn vector(&self, expr: &VectorExpr) -> Result<Vec<Element>, ExprError> {
        match expr {
            VectorExpr::Instant(selector) => self.instant(selector),
            VectorExpr::Range {
                func,
                selector,
                window,
            } => self.range(*func, selector, *window),
            VectorExpr::Aggregate { op, by, inner } => {
                let elements = self.vector(inner)?;
                Ok(aggregate(*op, by, elements))
            }
        }
    }

    fn instant(&self, selector: &Selector) -> Result<Vec<Element>, ExprError> {
        let windows = self.select(selector, self.lookback)?;
        Ok(windows
            .into_iter()
            .filter_map(|(labels, samples)| {
                samples.last().map(|s| Element {
                    labels,
                    value: s.value,
                })
            })
            .collect())
    }

    fn range(
        &self,
        func: RangeFunc,
        selector: &Selector,
        window: Duration,
    ) -> Result<Vec<Element>, ExprError> {
        let retention = Duration::from_millis(self.store.retention_ms().max(0) as u64);
        if window > retention {
            return Err(ExprError::WindowExceedsRetention {
                window: format_duration(window),
                retention: format_duration(retention),
            });
        }

        let windows = self.select(selector, window)?;
        Ok(windows
            .into_iter()
            .filter(|(_, samples)| samples.len() >= func.min_samples())
            .filter_map(|(labels, samples)| {
                let value = apply_range_func(func, &samples, window)?;
                Some(Element {
                    labels: labels.without_name(),
                    value,
                })
            })
            .collect())
    }

    fn select(
        &self,
        selector: &Selector,
        window: Duration,
    ) -> Result<Vec<(Labels, Vec<Sample>)>, ExprError> {
        if !self.store.has_metric(&selector.metric) {
            return Err(ExprError::MissingMetric(selector.metric.clone()));
        }

        let start = self.time.saturating_sub(duration_millis(window));
        Ok(self
            .store
            .select(&selector.metric, start, self.time, |labels| {
                matches_all(&selector.matchers, labels)
            })
            .into_iter()
            .map(|w| (w.labels, w.samples))
            .collect())
    }
}

/// Apply a range function to time-ordered samples
pub fn apply_range_func(func: RangeFunc, samples: &[Sample], window: Duration) -> Option<f64> {
    let first = samples.first()?;
    let last = samples.last()?;

    let value = match func {
        RangeFunc::Increase => counter_increase(samples)?,
        RangeFunc::Rate => {
            let secs = window.as_secs_f64();
            if secs <= 0.0 {
                return None;
            }
            counter_increase(samples)? / secs
        }
        RangeFunc::Delta => {
            if samples.len() < 2 {
                return None;
            }
            last.value - first.value
        }
        RangeFunc::AvgOverTime => {
            samples.iter().map(|s| s.value).sum::<f64>() / samples.len() as f64
        }
        RangeFunc::MinOverTime => samples
            .iter()
            .map(|s| s.value)
            .fold(f64::INFINITY, f64::min),
        RangeFunc::MaxOverTime => samples
            .iter()
            .map(|s| s.value)
            .fold(f64::NEG_INFINITY, f64::max),
        RangeFunc::SumOverTime => samples.iter().map(|s| s.value).sum(),
        RangeFunc::CountOverTime => samples.len() as f64,
        RangeFunc::LastOverTime => last.value,
    };

    Some(value)
}

/// Increase of a counter across the samples, compensating for resets
fn counter_increase(samples: &[Sample]) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }

    let mut total = 0.0;
    let mut prev = samples[0].value;
    for sample in &samples[1..] {
        if sample.value < prev {
            // Counter reset: the new value counts from zero
            total += sample.value;
        } else {
            total += sample.value - prev;
        }
        prev = sample.value;
    }
    Some(total)
}

fn aggregate(op: AggregateOp, by: &[String], elements: Vec<Element>) -> Vec<Element> {
    let mut groups: HashMap<Labels, Vec<f64>> = HashMap::new();
    for element in elements {
        groups
            .entry(element.labels.project(by))
            .or_default()
            .push(element.value);
    }

    let mut result: Vec<Element> = groups
        .into_iter()
        .map(|(labels, values)| {
            let value = match op {
                AggregateOp::Sum => values.iter().sum(),
                AggregateOp::Avg => values.iter().sum::<f64>() / values.len() as f64,
                AggregateOp::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
                AggregateOp::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                AggregateOp::Count => values.len() as f64,
            };
            Element { labels, value }
        })
        .collect();

    result.sort_by(|a, b| a.labels.cmp(&b.labels));
    result
}
