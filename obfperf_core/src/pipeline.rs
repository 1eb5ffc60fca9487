use crate::aggregator::aggregate;
use crate::builder::{BuildOutput, VariantBuilder};
use crate::collector::{MeasureError, MetricCollector};
use crate::comparison::{AssembleError, ComparisonResult, Measured, RunParameters, assemble};
use crate::loader::{LoadedConfigs, ObfuscationConfig};
use crate::settings::{BenchSettings, SettingsError};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::info;

/// Errors that abort a whole benchmark. Everything else is recorded in the
/// comparison instead.
#[derive(Error, Debug)]
pub enum BenchError {
    #[error("Source file {path:?} is not readable: {source}")]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Output directory {path:?} is not writable: {source}")]
    OutputNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("Failed to start build workers: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Measure(#[from] MeasureError),

    #[error("Comparison invariant violated: {0}")]
    Assemble(#[from] AssembleError),
}

/// Sequences build, measurement, aggregation and assembly for one source file.
pub struct Benchmark {
    settings: BenchSettings,
    output_dir: PathBuf,
}

impl Benchmark {
    pub fn new(settings: BenchSettings, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            output_dir: output_dir.into(),
        }
    }

    pub fn settings(&self) -> &BenchSettings {
        &self.settings
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Compares the baseline build of `source` against one build per loaded
    /// config. Builds may run in parallel; measurements never do.
    pub fn run(&self, source: &Path, loaded: LoadedConfigs) -> Result<ComparisonResult, BenchError> {
        self.settings.validate()?;
        self.check_source(source)?;
        self.check_output_dir()?;

        let started = Instant::now();
        let LoadedConfigs { configs, rejected } = loaded;
        let run = &self.settings.run;
        info!(
            "Benchmarking {source:?}: {} configs, {} rejected, {} runs + {} warm-ups at -O{}",
            configs.len(),
            rejected.len(),
            run.runs,
            run.warmups,
            run.optimization_level
        );

        let (baseline, builds) = self.build_all(source, &configs)?;

        let collector = MetricCollector::new(&self.settings);
        let baseline = self.measure(&collector, baseline)?;
        let mut measured = Vec::with_capacity(builds.len());
        for output in builds {
            measured.push(self.measure(&collector, output)?);
        }

        let parameters = RunParameters {
            source: source.to_path_buf(),
            runs: run.runs,
            warmups: run.warmups,
            optimization_level: run.optimization_level,
        };
        let result = assemble(parameters, baseline, &configs, measured, rejected)?;
        info!(
            "Benchmark finished in {:.2?} with {} entries",
            started.elapsed(),
            result.entries().len()
        );
        Ok(result)
    }

    /// The baseline build, then one build per config in config order.
    fn build_all(
        &self,
        source: &Path,
        configs: &[Arc<ObfuscationConfig>],
    ) -> Result<(BuildOutput, Vec<BuildOutput>), BenchError> {
        let jobs = self.settings.effective_jobs();
        info!("Building {} variants on {jobs} worker(s)", configs.len() + 1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .thread_name(|i| format!("obfperf-build-{i}"))
            .build()?;

        let builder = VariantBuilder::new(&self.settings);
        Ok(pool.install(|| {
            rayon::join(
                || builder.build(source, None),
                || {
                    configs
                        .par_iter()
                        .map(|config| builder.build(source, Some(Arc::clone(config))))
                        .collect::<Vec<_>>()
                },
            )
        }))
    }

    fn measure(
        &self,
        collector: &MetricCollector<'_>,
        output: BuildOutput,
    ) -> Result<Measured, BenchError> {
        if !output.variant.is_built() {
            return Ok(Measured::unmeasured(output.into_variant()));
        }

        let run = &self.settings.run;
        let snapshot = collector.static_snapshot(&output.variant);
        let runs = collector.measure(&output.variant, run.runs, run.warmups)?;
        // Drops the workspace; the executable is no longer needed.
        let variant = output.into_variant().with_static_snapshot(snapshot);
        let aggregate = aggregate(&runs).with_static_scores(variant.static_snapshot());
        info!(
            "'{}': {} of {} runs usable",
            variant.label(),
            aggregate.samples(),
            runs.len()
        );
        Ok(Measured {
            variant,
            runs,
            aggregate,
        })
    }

    fn check_source(&self, source: &Path) -> Result<(), BenchError> {
        let unreadable = |e| BenchError::SourceUnreadable {
            path: source.to_path_buf(),
            source: e,
        };
        let metadata = std::fs::metadata(source).map_err(unreadable)?;
        if !metadata.is_file() {
            return Err(unreadable(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "not a regular file",
            )));
        }
        std::fs::File::open(source).map_err(unreadable)?;
        Ok(())
    }

    fn check_output_dir(&self) -> Result<(), BenchError> {
        let not_writable = |e| BenchError::OutputNotWritable {
            path: self.output_dir.clone(),
            source: e,
        };
        std::fs::create_dir_all(&self.output_dir).map_err(not_writable)?;
        tempfile::Builder::new()
            .prefix(".obfperf-write-check-")
            .tempfile_in(&self.output_dir)
            .map_err(not_writable)?;
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::comparison::EntryStatus;
    use crate::record::{Metric, RunOutcome};
    use crate::test_support::{TestBench, write_plan};
    use crate::variant::{BuildStatus, StageFailure};

    fn loaded(bench: &TestBench, descriptors: &[(&str, &str)]) -> LoadedConfigs {
        LoadedConfigs {
            configs: descriptors
                .iter()
                .map(|(name, args)| {
                    let mut tokens = vec!["tigress".to_string()];
                    tokens.extend(args.split_whitespace().map(str::to_string));
                    Arc::new(ObfuscationConfig::new(bench.dir().join(name), tokens))
                })
                .collect(),
            rejected: Vec::new(),
        }
    }

    fn benchmark(bench: &TestBench) -> Benchmark {
        Benchmark::new(bench.settings.clone(), bench.dir().join("out"))
    }

    #[test]
    fn failing_obfuscator_keeps_baseline_and_records_failure() {
        let bench = TestBench::new();
        let result = benchmark(&bench)
            .run(&bench.source, loaded(&bench, &[("bad.txt", "--Mode=Fail")]))
            .unwrap();

        assert_eq!(result.entries().len(), 2);
        let baseline = result.baseline();
        assert!(baseline.variant.is_baseline());
        match baseline.status() {
            EntryStatus::Measured(aggregate) => {
                for metric in Metric::ALL {
                    assert!(aggregate.get(metric).is_some(), "{metric} missing");
                }
            }
            other => panic!("Expected measured baseline, got {other:?}"),
        }

        let failed = &result.configurations()[0];
        assert!(matches!(
            failed.status(),
            EntryStatus::ObfuscationFailed(StageFailure::Exited { code: 1, .. })
        ));
        assert!(!failed.aggregate.is_defined());
        assert!(failed.runs.is_empty());
    }

    #[test]
    fn malformed_report_on_one_run_is_excluded() {
        let mut bench = TestBench::new();
        let plan = write_plan(
            bench.dir(),
            &[
                "0.500 9000 0 90 0",
                "0.500 9000 0 90 0",
                "0.010 2000 1 20 0",
                "garbage",
                "0.014 2400 1 24 0",
            ],
        );
        bench.use_wrapper_plan(&plan);
        bench.settings.run.runs = 3;
        bench.settings.run.warmups = 2;

        let result = benchmark(&bench)
            .run(&bench.source, loaded(&bench, &[("bad.txt", "--Mode=Fail")]))
            .unwrap();

        let baseline = result.baseline();
        assert_eq!(baseline.runs.len(), 3);
        assert!(matches!(
            baseline.runs[1].outcome,
            RunOutcome::Failed {
                reason: StageFailure::MalformedReport { .. }
            }
        ));
        let wall = baseline.aggregate.get(Metric::ReportedWallSeconds).unwrap();
        assert_eq!(wall.count, 2);
        assert!((wall.mean - 0.012).abs() < 1e-12);
        assert_eq!(wall.min, 0.010);
        assert_eq!(wall.max, 0.014);
        assert_eq!(baseline.aggregate.failed_runs(), 1);
    }

    #[test]
    fn warmups_never_reach_the_aggregate() {
        let mut bench = TestBench::new();
        let plan = write_plan(
            bench.dir(),
            &["0.100 1000 0 10 0", "0.010 1000 0 10 0", "0.012 1000 0 10 0"],
        );
        bench.use_wrapper_plan(&plan);
        bench.settings.run.runs = 2;
        bench.settings.run.warmups = 1;

        let result = benchmark(&bench)
            .run(&bench.source, LoadedConfigs::default())
            .unwrap();
        let wall = result
            .baseline()
            .aggregate
            .get(Metric::ReportedWallSeconds)
            .copied()
            .unwrap();
        assert!((wall.mean - 0.011).abs() < 1e-12);
        assert_eq!(wall.count, 2);
    }

    #[test]
    fn mixed_failures_keep_one_entry_per_config_in_order() {
        let mut bench = TestBench::new();
        bench.settings.run.jobs = 4;
        bench.settings.timeouts.obfuscate_ms = 300;
        let descriptors = [
            ("d-ok.txt", "--Transform=Flatten"),
            ("c-fail.txt", "--Mode=Fail"),
            ("b-broken.txt", "--Mode=BreakCompile"),
            ("a-hang.txt", "--Mode=Hang"),
            ("e-silent.txt", "--Mode=NoOutput"),
        ];
        let result = benchmark(&bench)
            .run(&bench.source, loaded(&bench, &descriptors))
            .unwrap();

        let labels: Vec<_> = result.entries().iter().map(|e| e.variant.label()).collect();
        assert_eq!(
            labels,
            vec!["baseline", "d-ok", "c-fail", "b-broken", "a-hang", "e-silent"]
        );
        let statuses: Vec<_> = result
            .configurations()
            .iter()
            .map(|e| e.variant.status().clone())
            .collect();
        assert_eq!(statuses[0], BuildStatus::Built);
        assert!(matches!(statuses[1], BuildStatus::ObfuscationFailed(StageFailure::Exited { .. })));
        assert!(matches!(statuses[2], BuildStatus::CompileFailed(_)));
        assert!(matches!(&statuses[3], BuildStatus::ObfuscationFailed(f) if f.is_timeout()));
        assert!(matches!(
            statuses[4],
            BuildStatus::ObfuscationFailed(StageFailure::MissingArtifact { .. })
        ));
        for entry in result.configurations() {
            if !entry.variant.is_built() {
                assert!(!entry.aggregate.is_defined());
            }
        }
        let overhead = &result.configurations()[0].overhead;
        assert_eq!(overhead.get(&Metric::ReportedWallSeconds), Some(&1.0));
        assert!(overhead[&Metric::WallSeconds] > 0.0);
    }

    #[test]
    fn crashing_binary_yields_no_usable_samples() {
        let mut bench = TestBench::new();
        let plan = write_plan(bench.dir(), &["0.010 1000 0 10 0", "0.010 1000 0 10 1"]);
        bench.use_wrapper_plan(&plan);
        bench.settings.run.runs = 1;

        let result = benchmark(&bench)
            .run(&bench.source, loaded(&bench, &[("crash.txt", "")]))
            .unwrap();
        assert!(matches!(result.baseline().status(), EntryStatus::Measured(_)));
        let entry = &result.configurations()[0];
        assert_eq!(entry.status(), EntryStatus::NoUsableSamples);
        assert_eq!(entry.aggregate.failed_runs(), 1);
        assert!(entry.overhead.is_empty());
    }

    #[test]
    fn static_scores_flow_into_the_aggregate() {
        let mut bench = TestBench::new();
        bench.settings.tools.extractor = Some(vec![
            "sh".to_string(),
            bench.target("fake_extractor.sh").to_string_lossy().into_owned(),
        ]);
        let result = benchmark(&bench)
            .run(&bench.source, loaded(&bench, &[("x.txt", "")]))
            .unwrap();
        for entry in result.entries() {
            let scores = entry.aggregate.static_scores().unwrap();
            assert_eq!(scores.scores["volume"], 120.0);
            assert!(entry.variant.static_snapshot().is_some());
            let distance = entry.variant.code_size().unwrap().compression_distance;
            assert!(distance.is_some_and(|d| (0.0..=1.0).contains(&d)));
        }
    }

    #[test]
    fn rejected_configs_are_reported() {
        let bench = TestBench::new();
        let empty = bench.dir().join("empty.txt");
        std::fs::write(&empty, "# nothing here\n").unwrap();
        let good = bench.dir().join("good.txt");
        std::fs::write(&good, "tigress --Transform=Virtualize\n").unwrap();
        let loaded = crate::loader::load_configs(&[empty.clone(), good]);

        let result = benchmark(&bench).run(&bench.source, loaded).unwrap();
        assert_eq!(result.entries().len(), 2);
        assert_eq!(result.rejected().len(), 1);
        assert_eq!(result.rejected()[0].path, empty);
    }

    #[test]
    fn workspaces_are_cleaned_up() {
        let bench = TestBench::new();
        benchmark(&bench)
            .run(&bench.source, loaded(&bench, &[("a.txt", ""), ("b.txt", "--Mode=Fail")]))
            .unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(bench.dir())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("obfperf-"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn fatal_preconditions_abort() {
        let bench = TestBench::new();

        let missing = bench.dir().join("missing.c");
        assert!(matches!(
            benchmark(&bench).run(&missing, LoadedConfigs::default()),
            Err(BenchError::SourceUnreadable { .. })
        ));

        let blocked = Benchmark::new(bench.settings.clone(), bench.source.join("out"));
        assert!(matches!(
            blocked.run(&bench.source, LoadedConfigs::default()),
            Err(BenchError::OutputNotWritable { .. })
        ));

        let mut settings = bench.settings.clone();
        settings.run.runs = 0;
        assert!(matches!(
            Benchmark::new(settings, bench.dir()).run(&bench.source, LoadedConfigs::default()),
            Err(BenchError::Settings(SettingsError::Invalid(_)))
        ));
    }
}
