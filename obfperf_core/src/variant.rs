use crate::loader::ObfuscationConfig;
use crate::process::{Execution, ExecutionStatus, output_tail};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const BASELINE_LABEL: &str = "baseline";

const STDERR_TAIL_CHARS: usize = 2000;

/// Why one stage (obfuscate, compile, run, extract) did not produce its result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum StageFailure {
    Exited { code: i32, stderr: String },
    Signaled { signal: i32 },
    TimedOut { after_ms: u64 },
    SpawnFailed { message: String },
    MissingArtifact { path: PathBuf },
    MalformedReport { message: String },
    Io { message: String },
}

impl StageFailure {
    /// `None` when the execution succeeded.
    pub fn from_execution(execution: &Execution, timeout: Duration) -> Option<Self> {
        match &execution.status {
            ExecutionStatus::Ok => None,
            ExecutionStatus::Exited(code) => Some(StageFailure::Exited {
                code: *code,
                stderr: output_tail(&execution.output.stderr, STDERR_TAIL_CHARS),
            }),
            ExecutionStatus::Signaled(signal) => Some(StageFailure::Signaled { signal: *signal }),
            ExecutionStatus::Timeout => Some(StageFailure::TimedOut {
                after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            ExecutionStatus::Other(message) => Some(StageFailure::SpawnFailed {
                message: message.clone(),
            }),
        }
    }

    pub fn io(context: impl fmt::Display, err: std::io::Error) -> Self {
        StageFailure::Io {
            message: format!("{context}: {err}"),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StageFailure::TimedOut { .. })
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageFailure::Exited { code, .. } => write!(f, "exited with code {code}"),
            StageFailure::Signaled { signal } => write!(f, "terminated by signal {signal}"),
            StageFailure::TimedOut { after_ms } => write!(f, "timed out after {after_ms} ms"),
            StageFailure::SpawnFailed { message } => write!(f, "{message}"),
            StageFailure::MissingArtifact { path } => write!(f, "no artifact at {path:?}"),
            StageFailure::MalformedReport { message } => write!(f, "malformed report: {message}"),
            StageFailure::Io { message } => write!(f, "{message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "status", content = "reason")]
pub enum BuildStatus {
    Built,
    ObfuscationFailed(StageFailure),
    CompileFailed(StageFailure),
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildStatus::Built => write!(f, "built"),
            BuildStatus::ObfuscationFailed(reason) => write!(f, "obfuscation failed ({reason})"),
            BuildStatus::CompileFailed(reason) => write!(f, "compilation failed ({reason})"),
        }
    }
}

/// Static sizes of a built variant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CodeSize {
    pub source_bytes: u64,
    pub source_lines: usize,
    pub executable_bytes: u64,
    /// Normalized compression distance from the original source; `None` if
    /// it could not be computed.
    pub compression_distance: Option<f64>,
}

/// Wall time spent in each build stage that ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BuildTimings {
    pub obfuscate_seconds: Option<f64>,
    pub compile_seconds: Option<f64>,
}

/// Complexity scores reported by the external extractor, kept opaque.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StaticSnapshot {
    pub scores: BTreeMap<String, f64>,
}

/// One candidate under comparison: the baseline (no config) or an obfuscated build.
///
/// Only `Built` variants carry an executable; failures keep their reason and
/// stay in the comparison.
#[derive(Debug, Clone, Serialize)]
pub struct Variant {
    label: String,
    config: Option<Arc<ObfuscationConfig>>,
    #[serde(flatten)]
    status: BuildStatus,
    source: Option<PathBuf>,
    executable: Option<PathBuf>,
    code_size: Option<CodeSize>,
    timings: BuildTimings,
    static_snapshot: Option<StaticSnapshot>,
}

impl Variant {
    pub(crate) fn built(
        config: Option<Arc<ObfuscationConfig>>,
        source: PathBuf,
        executable: PathBuf,
        code_size: CodeSize,
        timings: BuildTimings,
    ) -> Self {
        Self {
            label: label_for(config.as_deref()),
            config,
            status: BuildStatus::Built,
            source: Some(source),
            executable: Some(executable),
            code_size: Some(code_size),
            timings,
            static_snapshot: None,
        }
    }

    pub(crate) fn failed(
        config: Option<Arc<ObfuscationConfig>>,
        status: BuildStatus,
        source: Option<PathBuf>,
        timings: BuildTimings,
    ) -> Self {
        debug_assert!(status != BuildStatus::Built);
        Self {
            label: label_for(config.as_deref()),
            config,
            status,
            source,
            executable: None,
            code_size: None,
            timings,
            static_snapshot: None,
        }
    }

    /// Attaches the extractor's scores; only meaningful before the variant is shared.
    pub(crate) fn with_static_snapshot(mut self, snapshot: Option<StaticSnapshot>) -> Self {
        if self.is_built() {
            self.static_snapshot = snapshot;
        }
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn config(&self) -> Option<&Arc<ObfuscationConfig>> {
        self.config.as_ref()
    }

    pub fn is_baseline(&self) -> bool {
        self.config.is_none()
    }

    pub fn status(&self) -> &BuildStatus {
        &self.status
    }

    pub fn is_built(&self) -> bool {
        self.status == BuildStatus::Built
    }

    /// The source that was compiled: the obfuscator's output, or the original
    /// file for the baseline. Present whenever that source was produced.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn executable(&self) -> Option<&Path> {
        self.executable.as_deref()
    }

    pub fn code_size(&self) -> Option<&CodeSize> {
        self.code_size.as_ref()
    }

    pub fn timings(&self) -> &BuildTimings {
        &self.timings
    }

    pub fn static_snapshot(&self) -> Option<&StaticSnapshot> {
        self.static_snapshot.as_ref()
    }
}

fn label_for(config: Option<&ObfuscationConfig>) -> String {
    config.map_or_else(|| BASELINE_LABEL.to_string(), |c| c.name().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessOutput;

    #[test]
    fn stage_failure_maps_execution_statuses() {
        let exited = Execution {
            status: ExecutionStatus::Exited(2),
            output: ProcessOutput {
                stderr: b"fatal error: boom\n".to_vec(),
                ..ProcessOutput::default()
            },
        };
        assert_eq!(
            StageFailure::from_execution(&exited, Duration::from_secs(1)),
            Some(StageFailure::Exited {
                code: 2,
                stderr: "fatal error: boom".to_string()
            })
        );

        let timed_out = Execution {
            status: ExecutionStatus::Timeout,
            output: ProcessOutput::default(),
        };
        let failure = StageFailure::from_execution(&timed_out, Duration::from_millis(250)).unwrap();
        assert!(failure.is_timeout());
        assert_eq!(failure.to_string(), "timed out after 250 ms");

        let ok = Execution {
            status: ExecutionStatus::Ok,
            output: ProcessOutput::default(),
        };
        assert_eq!(StageFailure::from_execution(&ok, Duration::from_secs(1)), None);
    }

    #[test]
    fn failed_variant_ignores_static_snapshot() {
        let config = Arc::new(ObfuscationConfig::new(
            "10-split.txt",
            vec!["tigress".into(), "--Transform=Split".into()],
        ));
        let variant = Variant::failed(
            Some(config),
            BuildStatus::ObfuscationFailed(StageFailure::MissingArtifact {
                path: PathBuf::from("/tmp/out.c"),
            }),
            None,
            BuildTimings::default(),
        )
        .with_static_snapshot(Some(StaticSnapshot::default()));

        assert_eq!(variant.label(), "10-split");
        assert!(!variant.is_baseline());
        assert!(!variant.is_built());
        assert!(variant.executable().is_none());
        assert!(variant.static_snapshot().is_none());
    }

    #[test]
    fn baseline_variant_serializes_status_inline() {
        let variant = Variant::built(
            None,
            PathBuf::from("main.c"),
            PathBuf::from("a.out"),
            CodeSize {
                source_bytes: 10,
                source_lines: 1,
                executable_bytes: 100,
                compression_distance: Some(0.25),
            },
            BuildTimings::default(),
        );
        assert_eq!(variant.label(), BASELINE_LABEL);
        let json = serde_json::to_value(&variant).unwrap();
        assert_eq!(json["status"], "built");
        assert!(json["config"].is_null());
        assert_eq!(json["code_size"]["compression_distance"], 0.25);
    }
}
