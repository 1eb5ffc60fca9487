use crate::process::{CommandExecutor, CommandExecutorConfig, ExecutionStatus, output_tail};
use crate::record::{Measurements, RunRecord};
use crate::settings::BenchSettings;
use crate::variant::{StageFailure, StaticSnapshot, Variant};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// GNU `time` format producing one `key=value` line per field. `time`
/// expands the `\n` escapes itself.
pub const REPORT_FORMAT: &str = "wall_seconds=%e\\n\
                                 user_seconds=%U\\n\
                                 system_seconds=%S\\n\
                                 max_rss_kb=%M\\n\
                                 major_faults=%F\\n\
                                 minor_faults=%R\\n\
                                 voluntary_switches=%w\\n\
                                 involuntary_switches=%c\\n\
                                 exit_status=%x";

#[derive(Error, Debug)]
pub enum MeasureError {
    #[error("Variant '{label}' cannot be measured: {status}")]
    NotBuilt { label: String, status: String },
}

/// Parsed content of one wrapper report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WrapperReport {
    pub measurements: Measurements,
    pub exit_status: i32,
}

/// Produces the static-complexity snapshot of a source file.
pub trait ComplexityExtractor: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, source: &Path) -> Result<StaticSnapshot, StageFailure>;
}

/// Runs an external extractor that prints a JSON object of numeric scores.
///
/// Each extraction runs in its own scratch directory, so whatever the tool
/// leaves behind never lands next to the user's source.
pub struct CommandComplexityExtractor {
    command: Vec<String>,
    timeout: Duration,
    temp_root: Option<PathBuf>,
}

impl CommandComplexityExtractor {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self {
            command,
            timeout,
            temp_root: None,
        }
    }

    pub fn with_temp_root(mut self, temp_root: Option<PathBuf>) -> Self {
        self.temp_root = temp_root;
        self
    }
}

impl ComplexityExtractor for CommandComplexityExtractor {
    fn name(&self) -> &'static str {
        "CommandComplexityExtractor"
    }

    fn extract(&self, source: &Path) -> Result<StaticSnapshot, StageFailure> {
        let source = std::fs::canonicalize(source)
            .map_err(|e| StageFailure::io("Failed to resolve extractor input", e))?;
        let mut scratch_builder = tempfile::Builder::new();
        scratch_builder.prefix("obfperf-extract-");
        let scratch = match &self.temp_root {
            Some(root) => scratch_builder.tempdir_in(root),
            None => scratch_builder.tempdir(),
        }
        .map_err(|e| StageFailure::io("Failed to create extractor directory", e))?;

        let executor = CommandExecutor::new(CommandExecutorConfig {
            command: self.command.clone(),
            timeout: self.timeout,
            working_dir: Some(scratch.path().to_path_buf()),
        });
        let execution = executor.execute_sync(&[&source]);
        if let Some(failure) = StageFailure::from_execution(&execution, self.timeout) {
            return Err(failure);
        }
        parse_scores(&execution.output.stdout)
    }
}

/// Reads a JSON object, keeping only its numeric members.
pub fn parse_scores(stdout: &[u8]) -> Result<StaticSnapshot, StageFailure> {
    let malformed = |message: String| StageFailure::MalformedReport { message };
    let document: serde_json::Value = serde_json::from_slice(stdout)
        .map_err(|e| malformed(format!("extractor output is not JSON: {e}")))?;
    let object = document
        .as_object()
        .ok_or_else(|| malformed("extractor output is not a JSON object".to_string()))?;

    let scores: BTreeMap<String, f64> = object
        .iter()
        .filter_map(|(key, value)| value.as_f64().map(|v| (key.clone(), v)))
        .collect();
    if scores.is_empty() {
        return Err(malformed("extractor reported no numeric scores".to_string()));
    }
    Ok(StaticSnapshot { scores })
}

/// Executes built variants under the resource wrapper and extracts their
/// static scores.
pub struct MetricCollector<'a> {
    settings: &'a BenchSettings,
    extractor: Option<Box<dyn ComplexityExtractor + 'a>>,
}

impl<'a> MetricCollector<'a> {
    pub fn new(settings: &'a BenchSettings) -> Self {
        let extractor = settings.tools.extractor.clone().map(|command| {
            Box::new(
                CommandComplexityExtractor::new(command, settings.timeouts.extract())
                    .with_temp_root(settings.run.temp_root.clone()),
            ) as Box<dyn ComplexityExtractor + 'a>
        });
        Self {
            settings,
            extractor,
        }
    }

    pub fn with_extractor(mut self, extractor: Box<dyn ComplexityExtractor + 'a>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Runs `warmups + runs` executions strictly one after another and returns
    /// the `runs` measured records. Warm-up results are only checked for crashes.
    pub fn measure(
        &self,
        variant: &Variant,
        runs: u32,
        warmups: u32,
    ) -> Result<Vec<RunRecord>, MeasureError> {
        let executable = match (variant.is_built(), variant.executable()) {
            (true, Some(executable)) => executable,
            _ => {
                return Err(MeasureError::NotBuilt {
                    label: variant.label().to_string(),
                    status: variant.status().to_string(),
                });
            }
        };

        info!(
            "Measuring '{}': {warmups} warm-up + {runs} measured runs",
            variant.label()
        );

        for warmup in 1..=warmups {
            if let Err(reason) = self.run_once(executable) {
                warn!(
                    "Warm-up run {warmup} of '{}' failed: {reason}",
                    variant.label()
                );
            }
        }

        let mut records = Vec::with_capacity(runs as usize);
        for index in 1..=runs {
            let record = match self.run_once(executable) {
                Ok(measurements) => RunRecord::measured(index, measurements),
                Err(reason) => {
                    warn!("Run {index} of '{}' failed: {reason}", variant.label());
                    RunRecord::failed(index, reason)
                }
            };
            records.push(record);
        }
        Ok(records)
    }

    /// Extractor scores for the compiled source of a built variant. Any
    /// failure, or the absence of an extractor, yields `None`.
    pub fn static_snapshot(&self, variant: &Variant) -> Option<StaticSnapshot> {
        let extractor = self.extractor.as_ref()?;
        let source = variant.source().filter(|_| variant.is_built())?;
        match extractor.extract(source) {
            Ok(snapshot) => {
                debug!(
                    "{} scored '{}': {:?}",
                    extractor.name(),
                    variant.label(),
                    snapshot.scores
                );
                Some(snapshot)
            }
            Err(reason) => {
                warn!(
                    "Static metric extraction for '{}' failed: {reason}",
                    variant.label()
                );
                None
            }
        }
    }

    fn run_once(&self, executable: &Path) -> Result<Measurements, StageFailure> {
        let mut report_builder = tempfile::Builder::new();
        report_builder.prefix("obfperf-report-");
        let report_file = match &self.settings.run.temp_root {
            Some(root) => report_builder.tempfile_in(root),
            None => report_builder.tempfile(),
        }
        .map_err(|e| StageFailure::io("Failed to create wrapper report file", e))?;

        let timeout = self.settings.timeouts.run();
        let executor = CommandExecutor::new(CommandExecutorConfig {
            command: self.settings.tools.wrapper.clone(),
            timeout,
            working_dir: executable.parent().map(Path::to_path_buf),
        });
        let execution = executor.execute_sync(&[
            OsStr::new("-f"),
            OsStr::new(REPORT_FORMAT),
            OsStr::new("-o"),
            report_file.path().as_os_str(),
            executable.as_os_str(),
        ]);

        match &execution.status {
            ExecutionStatus::Timeout | ExecutionStatus::Signaled(_) | ExecutionStatus::Other(_) => {
                return Err(StageFailure::from_execution(&execution, timeout)
                    .unwrap_or_else(|| StageFailure::SpawnFailed {
                        message: "wrapper did not complete".to_string(),
                    }));
            }
            ExecutionStatus::Ok | ExecutionStatus::Exited(_) => {}
        }

        let text = std::fs::read_to_string(report_file.path())
            .map_err(|e| StageFailure::io("Failed to read wrapper report", e))?;
        let report = match parse_report(&text) {
            Ok(report) => report,
            // The wrapper's own exit code explains a missing report better.
            Err(message) => {
                return Err(match StageFailure::from_execution(&execution, timeout) {
                    Some(failure) => failure,
                    None => StageFailure::MalformedReport { message },
                });
            }
        };

        if report.exit_status != 0 {
            return Err(StageFailure::Exited {
                code: report.exit_status,
                stderr: output_tail(&execution.output.stderr, 2000),
            });
        }
        if let Some(failure) = StageFailure::from_execution(&execution, timeout) {
            return Err(failure);
        }
        // Host timing replaces `%e`, which has 10ms resolution.
        Ok(Measurements {
            wall_seconds: execution.output.elapsed.as_secs_f64(),
            ..report.measurements
        })
    }
}

/// Parses a wrapper report written with [`REPORT_FORMAT`].
///
/// Lines without `=` (GNU `time` prefixes "Command exited with non-zero
/// status" notes) are skipped. Every field is required. Both wall-time fields
/// carry the reported value; the collector replaces `wall_seconds` with its
/// own timing.
pub fn parse_report(text: &str) -> Result<WrapperReport, String> {
    let fields: BTreeMap<&str, &str> = text
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect();

    let float = |key: &str| -> Result<f64, String> {
        let raw = fields.get(key).ok_or_else(|| format!("missing {key}"))?;
        parse_decimal(raw).ok_or_else(|| format!("unparsable {key}: {raw:?}"))
    };
    let count = |key: &str| -> Result<u64, String> {
        let raw = fields.get(key).ok_or_else(|| format!("missing {key}"))?;
        parse_count(raw).ok_or_else(|| format!("unparsable {key}: {raw:?}"))
    };

    let exit_raw = fields
        .get("exit_status")
        .ok_or_else(|| "missing exit_status".to_string())?;
    let exit_status = exit_raw
        .parse::<i32>()
        .map_err(|_| format!("unparsable exit_status: {exit_raw:?}"))?;

    let reported_wall = float("wall_seconds")?;
    Ok(WrapperReport {
        measurements: Measurements {
            wall_seconds: reported_wall,
            reported_wall_seconds: reported_wall,
            user_seconds: float("user_seconds")?,
            system_seconds: float("system_seconds")?,
            max_rss_kb: count("max_rss_kb")?,
            major_faults: count("major_faults")?,
            minor_faults: count("minor_faults")?,
            voluntary_switches: count("voluntary_switches")?,
            involuntary_switches: count("involuntary_switches")?,
        },
        exit_status,
    })
}

/// Accepts both `0.25` and the decimal-comma form `0,25`; with both
/// separators present the comma is taken as digit grouping.
fn parse_decimal(raw: &str) -> Option<f64> {
    let normalized = if raw.contains('.') {
        raw.replace(',', "")
    } else {
        raw.replace(',', ".")
    };
    normalized
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}

/// Integer counts, ignoring locale digit-grouping characters.
fn parse_count(raw: &str) -> Option<u64> {
    let digits: String = raw
        .chars()
        .filter(|c| !matches!(c, ',' | '.' | '\'' | '_' | ' ' | '\u{a0}'))
        .collect();
    digits.parse::<u64>().ok()
}
