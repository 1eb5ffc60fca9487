pub mod aggregator;
pub mod builder;
pub mod collector;
pub mod comparison;
pub mod distance;
pub mod loader;
pub mod pipeline;
pub mod process;
pub mod record;
pub mod settings;
pub mod variant;

#[cfg(test)]
mod test_support;

pub use aggregator::{MetricAggregate, Summary, aggregate};
pub use builder::{BuildOutput, VariantBuilder};
pub use collector::{CommandComplexityExtractor, ComplexityExtractor, MeasureError, MetricCollector};
pub use comparison::{
    AssembleError, ComparisonEntry, ComparisonResult, EntryStatus, RunParameters, assemble,
};
pub use distance::normalized_compression_distance;
pub use loader::{ConfigParseError, LoadedConfigs, ObfuscationConfig, RejectedConfig, load_configs};
pub use pipeline::{BenchError, Benchmark};
pub use process::{CommandExecutor, CommandExecutorConfig, ExecutionStatus};
pub use record::{Metric, RunOutcome, RunRecord};
pub use settings::{BenchSettings, SettingsError};
pub use variant::{BuildStatus, StageFailure, StaticSnapshot, Variant};
