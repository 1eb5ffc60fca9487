use crate::record::{Metric, RunRecord};
use crate::variant::StaticSnapshot;
use serde::Serialize;
use std::collections::BTreeMap;

/// Welford's online mean/variance accumulator, with min and max.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningStats {
    count: usize,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        self.count += 1;
        if self.count == 1 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// `None` without samples. A single sample has a standard deviation of zero.
    pub fn summary(&self) -> Option<Summary> {
        if self.count == 0 {
            return None;
        }
        let variance = if self.count > 1 {
            (self.m2 / (self.count - 1) as f64).max(0.0)
        } else {
            0.0
        };
        Some(Summary {
            mean: self.mean,
            std_dev: variance.sqrt(),
            min: self.min,
            max: self.max,
            count: self.count,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub mean: f64,
    /// Sample standard deviation (n - 1 denominator).
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

/// Per-metric summaries of one variant's clean runs.
///
/// A metric missing from the map is undefined: no run produced it. This is
/// never conflated with a measured zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricAggregate {
    samples: usize,
    failed_runs: usize,
    metrics: BTreeMap<Metric, Summary>,
    static_scores: Option<StaticSnapshot>,
}

impl MetricAggregate {
    /// Aggregate of a variant that never produced a run.
    pub fn undefined() -> Self {
        Self::default()
    }

    /// Carries the variant's static snapshot alongside the runtime metrics.
    pub fn with_static_scores(mut self, snapshot: Option<&StaticSnapshot>) -> Self {
        self.static_scores = snapshot.cloned();
        self
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn failed_runs(&self) -> usize {
        self.failed_runs
    }

    pub fn is_defined(&self) -> bool {
        self.samples > 0
    }

    pub fn get(&self, metric: Metric) -> Option<&Summary> {
        self.metrics.get(&metric)
    }

    pub fn metrics(&self) -> impl Iterator<Item = (Metric, &Summary)> {
        self.metrics.iter().map(|(metric, summary)| (*metric, summary))
    }

    pub fn static_scores(&self) -> Option<&StaticSnapshot> {
        self.static_scores.as_ref()
    }
}

/// Reduces run records to per-metric statistics, skipping failed runs.
pub fn aggregate(records: &[RunRecord]) -> MetricAggregate {
    let mut stats: BTreeMap<Metric, RunningStats> = BTreeMap::new();
    let mut samples = 0;
    let mut failed_runs = 0;

    for record in records {
        let Some(measurements) = record.measurements() else {
            failed_runs += 1;
            continue;
        };
        samples += 1;
        for metric in Metric::ALL {
            stats
                .entry(metric)
                .or_default()
                .push(measurements.value(metric));
        }
    }

    MetricAggregate {
        samples,
        failed_runs,
        metrics: stats
            .into_iter()
            .filter_map(|(metric, s)| s.summary().map(|summary| (metric, summary)))
            .collect(),
        static_scores: None,
    }
}
