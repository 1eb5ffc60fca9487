use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const MAX_OPTIMIZATION_LEVEL: u8 = 3;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML from settings file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

/// External programs driven by the benchmark. Each entry is a command prefix;
/// the fixed arguments are appended by the stage that runs it.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ToolSettings {
    #[serde(default = "default_compiler")]
    pub compiler: Vec<String>,
    #[serde(default = "default_wrapper")]
    pub wrapper: Vec<String>,
    /// Replaces the leading invocation-name token of every config.
    #[serde(default)]
    pub obfuscator: Option<Vec<String>>,
    #[serde(default)]
    pub extractor: Option<Vec<String>>,
}

fn default_compiler() -> Vec<String> {
    vec!["gcc".to_string()]
}

fn default_wrapper() -> Vec<String> {
    vec!["/usr/bin/time".to_string()]
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            compiler: default_compiler(),
            wrapper: default_wrapper(),
            obfuscator: None,
            extractor: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TimeoutSettings {
    #[serde(default = "default_build_timeout_ms")]
    pub obfuscate_ms: u64,
    #[serde(default = "default_build_timeout_ms")]
    pub compile_ms: u64,
    #[serde(default = "default_run_timeout_ms")]
    pub run_ms: u64,
    #[serde(default = "default_run_timeout_ms")]
    pub extract_ms: u64,
}

fn default_build_timeout_ms() -> u64 {
    120_000
}

fn default_run_timeout_ms() -> u64 {
    30_000
}

impl TimeoutSettings {
    pub fn obfuscate(&self) -> Duration {
        Duration::from_millis(self.obfuscate_ms)
    }

    pub fn compile(&self) -> Duration {
        Duration::from_millis(self.compile_ms)
    }

    pub fn run(&self) -> Duration {
        Duration::from_millis(self.run_ms)
    }

    pub fn extract(&self) -> Duration {
        Duration::from_millis(self.extract_ms)
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            obfuscate_ms: default_build_timeout_ms(),
            compile_ms: default_build_timeout_ms(),
            run_ms: default_run_timeout_ms(),
            extract_ms: default_run_timeout_ms(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RunSettings {
    #[serde(default = "default_runs")]
    pub runs: u32,
    #[serde(default)]
    pub warmups: u32,
    #[serde(default)]
    pub optimization_level: u8,
    /// Upper bound on concurrent builds; clamped to the number of CPUs.
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    /// Parent directory for per-variant workspaces. System temp dir if unset.
    #[serde(default)]
    pub temp_root: Option<PathBuf>,
}

pub fn default_runs() -> u32 {
    1
}

pub fn default_jobs() -> usize {
    1
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            runs: default_runs(),
            warmups: 0,
            optimization_level: 0,
            jobs: default_jobs(),
            temp_root: None,
        }
    }
}

/// `#include` lines written ahead of the source before it is obfuscated.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct PreambleSettings {
    /// Installation directory of the obfuscator. No preamble is written without it.
    #[serde(default)]
    pub obfuscator_home: Option<PathBuf>,
    /// Headers under `obfuscator_home` needed by every transformation.
    #[serde(default = "default_obfuscator_headers")]
    pub default_headers: Vec<String>,
    /// Headers included verbatim, after the obfuscator ones.
    #[serde(default = "default_system_headers")]
    pub system_headers: Vec<String>,
    /// Lower-cased `--Transform=` value to extra headers under `obfuscator_home`.
    #[serde(default = "default_transform_headers")]
    pub transform_headers: BTreeMap<String, Vec<String>>,
}

fn default_obfuscator_headers() -> Vec<String> {
    vec!["tigress.h".to_string()]
}

fn default_system_headers() -> Vec<String> {
    vec!["pthread.h".to_string()]
}

fn default_transform_headers() -> BTreeMap<String, Vec<String>> {
    let jitter = vec!["jitter-amd64.c".to_string()];
    BTreeMap::from([
        ("jit".to_string(), jitter.clone()),
        ("jitdynamic".to_string(), jitter),
    ])
}

impl Default for PreambleSettings {
    fn default() -> Self {
        Self {
            obfuscator_home: None,
            default_headers: default_obfuscator_headers(),
            system_headers: default_system_headers(),
            transform_headers: default_transform_headers(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BenchSettings {
    #[serde(default)]
    pub tools: ToolSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default)]
    pub preamble: PreambleSettings,
}

impl BenchSettings {
    pub fn load_from_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.run.runs < 1 {
            return Err(SettingsError::Invalid("`runs` must be >= 1".to_string()));
        }
        if self.run.optimization_level > MAX_OPTIMIZATION_LEVEL {
            return Err(SettingsError::Invalid(format!(
                "`optimization-level` must be between 0 and {MAX_OPTIMIZATION_LEVEL}, got {}",
                self.run.optimization_level
            )));
        }
        if self.run.jobs < 1 {
            return Err(SettingsError::Invalid("`jobs` must be >= 1".to_string()));
        }
        for (name, command) in [
            ("compiler", Some(&self.tools.compiler)),
            ("wrapper", Some(&self.tools.wrapper)),
            ("obfuscator", self.tools.obfuscator.as_ref()),
            ("extractor", self.tools.extractor.as_ref()),
        ] {
            if command.is_some_and(|c| c.is_empty()) {
                return Err(SettingsError::Invalid(format!(
                    "`tools.{name}` must name a program"
                )));
            }
        }
        Ok(())
    }

    /// Number of build workers: the configured job count, never above the CPU count.
    pub fn effective_jobs(&self) -> usize {
        self.run.jobs.clamp(1, num_cpus::get().max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_document_yields_defaults() {
        let settings: BenchSettings = toml::from_str("").unwrap();
        assert_eq!(settings.tools.compiler, vec!["gcc"]);
        assert_eq!(settings.tools.wrapper, vec!["/usr/bin/time"]);
        assert_eq!(settings.run.runs, 1);
        assert_eq!(settings.run.warmups, 0);
        assert_eq!(settings.timeouts.run(), Duration::from_secs(30));
        assert_eq!(
            settings.preamble.transform_headers.get("jit"),
            Some(&vec!["jitter-amd64.c".to_string()])
        );
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn kebab_case_sections_parse() {
        let settings: BenchSettings = toml::from_str(
            r#"
            [tools]
            compiler = ["clang"]
            extractor = ["halstead", "--json"]

            [timeouts]
            run-ms = 500

            [run]
            runs = 10
            warmups = 2
            optimization-level = 2
            jobs = 4

            [preamble]
            obfuscator-home = "/opt/tigress"
            "#,
        )
        .unwrap();
        assert_eq!(settings.tools.compiler, vec!["clang"]);
        assert_eq!(
            settings.tools.extractor,
            Some(vec!["halstead".to_string(), "--json".to_string()])
        );
        assert_eq!(settings.timeouts.run_ms, 500);
        assert_eq!(settings.timeouts.compile_ms, 120_000);
        assert_eq!(settings.run.runs, 10);
        assert_eq!(settings.run.optimization_level, 2);
        assert_eq!(
            settings.preamble.obfuscator_home,
            Some(PathBuf::from("/opt/tigress"))
        );
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<BenchSettings, _> = toml::from_str("[run]\nrepetitions = 3\n");
        assert!(result.is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut settings = BenchSettings::default();
        settings.run.runs = 0;
        assert!(matches!(settings.validate(), Err(SettingsError::Invalid(_))));

        let mut settings = BenchSettings::default();
        settings.run.optimization_level = 4;
        assert!(matches!(settings.validate(), Err(SettingsError::Invalid(_))));

        let mut settings = BenchSettings::default();
        settings.tools.extractor = Some(Vec::new());
        assert!(matches!(settings.validate(), Err(SettingsError::Invalid(_))));
    }

    #[test]
    fn effective_jobs_is_bounded_by_cpus() {
        let mut settings = BenchSettings::default();
        settings.run.jobs = usize::MAX;
        assert_eq!(settings.effective_jobs(), num_cpus::get().max(1));
        settings.run.jobs = 1;
        assert_eq!(settings.effective_jobs(), 1);
    }

    #[test]
    fn load_from_file_reports_parse_errors_with_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("obfperf.toml");
        std::fs::write(&path, "[run\nruns = 2").unwrap();
        match BenchSettings::load_from_file(&path) {
            Err(SettingsError::Parse { path: p, .. }) => assert_eq!(p, path),
            other => panic!("Expected Parse error, got {other:?}"),
        }
        assert!(matches!(
            BenchSettings::load_from_file(&dir.path().join("missing.toml")),
            Err(SettingsError::Read { .. })
        ));
    }
}
