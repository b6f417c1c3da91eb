use std::collections::VecDeque;

use crate::data::Sample;

/// Time-ordered sample history of one series
#[derive(Debug, Clone, Default)]
pub struct Series {
    samples: VecDeque<Sample>,
}

/// Outcome of appending a sample to a series
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    Appended,
    /// Same timestamp as the newest sample, value replaced
    Replaced,
    /// Older than the newest sample, dropped
    OutOfOrder { newest: i64 },
}

impl Series {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample, keeping timestamps strictly increasing
    pub fn push(&mut self, sample: Sample) -> AppendResult {
        match self.samples.back_mut() {
            Some(last) if sample.timestamp < last.timestamp => AppendResult::OutOfOrder {
                newest: last.timestamp,
            },
            Some(last) if sample.timestamp == last.timestamp => {
                last.value = sample.value;
                AppendResult::Replaced
            }
            _ => {
                self.samples.push_back(sample);
                AppendResult::Appended
            }
        }
    }

    /// Drop samples with `timestamp < cutoff`. Returns the number removed.
    pub fn evict_before(&mut self, cutoff: i64) -> usize {
        let mut removed = 0;
        while let Some(front) = self.samples.front() {
            if front.timestamp < cutoff {
                self.samples.pop_front();
                removed += 1;
            } else {
                break;
            }
        }
        removed
    }

    /// Samples with `start < timestamp <= end`
    pub fn range(&self, start: i64, end: i64) -> Vec<Sample> {
        // Samples are sorted, so binary search for the left edge
        let from = self.samples.partition_point(|s| s.timestamp <= start);
        self.samples
            .iter()
            .skip(from)
            .take_while(|s| s.timestamp <= end)
            .copied()
            .collect()
    }

    pub fn latest(&self) -> Option<Sample> {
        self.samples.back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series_with(points: &[(i64, f64)]) -> Series {
        let mut series = Series::new();
        for &(ts, v) in points {
            series.push(Sample::new(ts, v));
        }
        series
    }

    #[test]
    fn test_push_ordering() {
        let mut series = series_with(&[(1000, 1.0), (2000, 2.0)]);

        assert_eq!(series.push(Sample::new(2000, 5.0)), AppendResult::Replaced);
        assert_eq!(
            series.push(Sample::new(1500, 9.0)),
            AppendResult::OutOfOrder { newest: 2000 }
        );
        assert_eq!(series.len(), 2);
        assert_eq!(series.latest(), Some(Sample::new(2000, 5.0)));
    }

    #[test]
    fn test_range_is_left_open() {
        let series = series_with(&[(1000, 1.0), (2000, 2.0), (3000, 3.0), (4000, 4.0)]);

        let window = series.range(1000, 3000);
        assert_eq!(window, vec![Sample::new(2000, 2.0), Sample::new(3000, 3.0)]);

        assert!(series.range(4000, 9000).is_empty());
    }

    #[test]
    fn test_evict_before() {
        let mut series = series_with(&[(1000, 1.0), (2000, 2.0), (3000, 3.0)]);
        assert_eq!(series.evict_before(2500), 2);
        assert_eq!(series.len(), 1);
        assert_eq!(series.evict_before(10_000), 1);
        assert!(series.is_empty());
    }
}
