use crate::aggregator::MetricAggregate;
use crate::loader::{ObfuscationConfig, RejectedConfig};
use crate::record::{Metric, RunRecord};
use crate::variant::{BuildStatus, StageFailure, Variant};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Broken ordering or pairing invariants. Any of these is a pipeline bug.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AssembleError {
    #[error("Baseline entry is attached to config '{0}'")]
    BaselineHasConfig(String),
    #[error("Entry '{0}' has no originating config")]
    MissingConfig(String),
    #[error("Entry '{0}' belongs to a config that was not loaded")]
    UnknownConfig(String),
    #[error("Config '{0}' has more than one entry")]
    DuplicateEntry(String),
    #[error("Config '{0}' has no entry")]
    MissingEntry(String),
    #[error("Entry '{0}' was not built but carries runtime metrics")]
    AggregateOnUnbuilt(String),
}

/// One variant after measurement and aggregation, ready to be assembled.
#[derive(Debug, Clone)]
pub struct Measured {
    pub variant: Variant,
    pub runs: Vec<RunRecord>,
    pub aggregate: MetricAggregate,
}

impl Measured {
    /// A variant that never reached measurement.
    pub fn unmeasured(variant: Variant) -> Self {
        Self {
            variant,
            runs: Vec::new(),
            aggregate: MetricAggregate::undefined(),
        }
    }
}

/// What happened to an entry, for exhaustive matching by presentation code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntryStatus<'a> {
    Measured(&'a MetricAggregate),
    NoUsableSamples,
    ObfuscationFailed(&'a StageFailure),
    CompileFailed(&'a StageFailure),
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonEntry {
    pub variant: Variant,
    pub runs: Vec<RunRecord>,
    pub aggregate: MetricAggregate,
    /// Mean of each metric relative to the baseline mean.
    pub overhead: BTreeMap<Metric, f64>,
}

impl ComparisonEntry {
    pub fn status(&self) -> EntryStatus<'_> {
        match self.variant.status() {
            BuildStatus::Built if self.aggregate.is_defined() => {
                EntryStatus::Measured(&self.aggregate)
            }
            BuildStatus::Built => EntryStatus::NoUsableSamples,
            BuildStatus::ObfuscationFailed(reason) => EntryStatus::ObfuscationFailed(reason),
            BuildStatus::CompileFailed(reason) => EntryStatus::CompileFailed(reason),
        }
    }
}

/// Parameters the comparison was produced with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunParameters {
    pub source: PathBuf,
    pub runs: u32,
    pub warmups: u32,
    pub optimization_level: u8,
}

/// Baseline first, then one entry per loaded config in load order. Read-only
/// once assembled.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonResult {
    parameters: RunParameters,
    entries: Vec<ComparisonEntry>,
    rejected: Vec<RejectedConfig>,
}

impl ComparisonResult {
    pub fn parameters(&self) -> &RunParameters {
        &self.parameters
    }

    pub fn baseline(&self) -> &ComparisonEntry {
        &self.entries[0]
    }

    pub fn configurations(&self) -> &[ComparisonEntry] {
        &self.entries[1..]
    }

    pub fn entries(&self) -> &[ComparisonEntry] {
        &self.entries
    }

    pub fn rejected(&self) -> &[RejectedConfig] {
        &self.rejected
    }
}

/// Orders `measured` by the position of its config in `configs`, putting the
/// baseline first. Configs are matched by identity, not by value.
pub fn assemble(
    parameters: RunParameters,
    baseline: Measured,
    configs: &[Arc<ObfuscationConfig>],
    measured: Vec<Measured>,
    rejected: Vec<RejectedConfig>,
) -> Result<ComparisonResult, AssembleError> {
    if let Some(config) = baseline.variant.config() {
        return Err(AssembleError::BaselineHasConfig(config.name().to_string()));
    }
    check_unbuilt(&baseline)?;

    let mut slots: Vec<Option<Measured>> = vec![None; configs.len()];
    for entry in measured {
        check_unbuilt(&entry)?;
        let label = entry.variant.label().to_string();
        let config = entry
            .variant
            .config()
            .ok_or_else(|| AssembleError::MissingConfig(label.clone()))?;
        let position = configs
            .iter()
            .position(|c| Arc::ptr_eq(c, config))
            .ok_or_else(|| AssembleError::UnknownConfig(label.clone()))?;
        if slots[position].is_some() {
            return Err(AssembleError::DuplicateEntry(label));
        }
        slots[position] = Some(entry);
    }

    let baseline_means = means(&baseline.aggregate);
    let mut entries = Vec::with_capacity(configs.len() + 1);
    entries.push(into_entry(baseline, &baseline_means));
    for (config, slot) in configs.iter().zip(slots) {
        let entry = slot.ok_or_else(|| AssembleError::MissingEntry(config.name().to_string()))?;
        entries.push(into_entry(entry, &baseline_means));
    }

    Ok(ComparisonResult {
        parameters,
        entries,
        rejected,
    })
}

fn check_unbuilt(entry: &Measured) -> Result<(), AssembleError> {
    if !entry.variant.is_built() && entry.aggregate.is_defined() {
        return Err(AssembleError::AggregateOnUnbuilt(
            entry.variant.label().to_string(),
        ));
    }
    Ok(())
}

fn means(aggregate: &MetricAggregate) -> BTreeMap<Metric, f64> {
    aggregate
        .metrics()
        .map(|(metric, summary)| (metric, summary.mean))
        .collect()
}

fn into_entry(measured: Measured, baseline_means: &BTreeMap<Metric, f64>) -> ComparisonEntry {
    let overhead = measured
        .aggregate
        .metrics()
        .filter_map(|(metric, summary)| {
            let base = *baseline_means.get(&metric)?;
            (base != 0.0).then(|| (metric, summary.mean / base))
        })
        .collect();
    ComparisonEntry {
        variant: measured.variant,
        runs: measured.runs,
        aggregate: measured.aggregate,
        overhead,
    }
}
