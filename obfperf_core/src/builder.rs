use crate::distance::normalized_compression_distance;
use crate::loader::ObfuscationConfig;
use crate::process::{CommandExecutor, CommandExecutorConfig};
use crate::settings::{BenchSettings, PreambleSettings};
use crate::variant::{BASELINE_LABEL, BuildStatus, BuildTimings, CodeSize, StageFailure, Variant};
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, warn};

const OUT_FLAG: &str = "--out";
const TRANSFORM_FLAG: &str = "--Transform=";

/// Scratch directory owned by one variant. Removed when dropped.
#[derive(Debug)]
pub struct VariantWorkspace {
    dir: TempDir,
}

impl VariantWorkspace {
    fn create(settings: &BenchSettings, label: &str, fingerprint: &str) -> std::io::Result<Self> {
        let prefix = format!(
            "obfperf-{label}-{}-",
            fingerprint.get(..8).unwrap_or(fingerprint)
        );
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match &settings.run.temp_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// A variant together with the workspace holding its artifacts. The
/// executable stays valid only while the workspace is alive.
#[derive(Debug)]
pub struct BuildOutput {
    pub variant: Variant,
    workspace: Option<VariantWorkspace>,
}

impl BuildOutput {
    fn new(variant: Variant, workspace: Option<VariantWorkspace>) -> Self {
        Self { variant, workspace }
    }

    pub fn workspace(&self) -> Option<&VariantWorkspace> {
        self.workspace.as_ref()
    }

    /// Releases the artifacts, keeping only the variant record.
    pub fn into_variant(self) -> Variant {
        self.variant
    }
}

/// Turns the source plus one config (or none, for the baseline) into a
/// compiled executable. Subprocess failures become the variant's status.
pub struct VariantBuilder<'a> {
    settings: &'a BenchSettings,
}

impl<'a> VariantBuilder<'a> {
    pub fn new(settings: &'a BenchSettings) -> Self {
        Self { settings }
    }

    pub fn build(&self, source: &Path, config: Option<Arc<ObfuscationConfig>>) -> BuildOutput {
        match config {
            None => self.build_baseline(source),
            Some(config) => self.build_obfuscated(source, config),
        }
    }

    fn build_baseline(&self, source: &Path) -> BuildOutput {
        info!("Building {BASELINE_LABEL} from {source:?}");
        let workspace = match VariantWorkspace::create(self.settings, BASELINE_LABEL, "00000000") {
            Ok(workspace) => workspace,
            Err(e) => {
                let failure = StageFailure::io("Failed to create variant workspace", e);
                warn!("{BASELINE_LABEL}: {failure}");
                return BuildOutput::new(
                    Variant::failed(
                        None,
                        BuildStatus::CompileFailed(failure),
                        Some(source.to_path_buf()),
                        BuildTimings::default(),
                    ),
                    None,
                );
            }
        };

        let executable = workspace
            .path()
            .join(artifact_stem(source, BASELINE_LABEL));
        let mut timings = BuildTimings::default();
        let variant = match self.compile(source, source, &executable, &mut timings) {
            Ok(code_size) => Variant::built(
                None,
                source.to_path_buf(),
                executable,
                code_size,
                timings,
            ),
            Err(failure) => {
                warn!("{BASELINE_LABEL}: compilation failed: {failure}");
                Variant::failed(
                    None,
                    BuildStatus::CompileFailed(failure),
                    Some(source.to_path_buf()),
                    timings,
                )
            }
        };
        BuildOutput::new(variant, Some(workspace))
    }

    fn build_obfuscated(&self, source: &Path, config: Arc<ObfuscationConfig>) -> BuildOutput {
        let label = config.name().to_string();
        info!("Building '{label}' from {:?}", config.path());
        let mut timings = BuildTimings::default();

        let workspace = match VariantWorkspace::create(self.settings, &label, &config.fingerprint())
        {
            Ok(workspace) => workspace,
            Err(e) => {
                let failure = StageFailure::io("Failed to create variant workspace", e);
                warn!("'{label}': {failure}");
                return BuildOutput::new(
                    Variant::failed(
                        Some(config),
                        BuildStatus::ObfuscationFailed(failure),
                        None,
                        timings,
                    ),
                    None,
                );
            }
        };

        let obfuscated = match self.obfuscate(source, &config, workspace.path(), &mut timings) {
            Ok(obfuscated) => obfuscated,
            Err(failure) => {
                warn!("'{label}': obfuscation failed: {failure}");
                let variant = Variant::failed(
                    Some(config),
                    BuildStatus::ObfuscationFailed(failure),
                    None,
                    timings,
                );
                return BuildOutput::new(variant, Some(workspace));
            }
        };

        let executable = workspace.path().join(artifact_stem(source, &label));
        let variant = match self.compile(source, &obfuscated, &executable, &mut timings) {
            Ok(code_size) => {
                Variant::built(Some(config), obfuscated, executable, code_size, timings)
            }
            Err(failure) => {
                warn!("'{label}': compilation failed: {failure}");
                Variant::failed(
                    Some(config),
                    BuildStatus::CompileFailed(failure),
                    Some(obfuscated),
                    timings,
                )
            }
        };
        BuildOutput::new(variant, Some(workspace))
    }

    /// Writes the prepared source into `workspace` and runs the obfuscator on
    /// it. Returns the path of the obfuscated source.
    fn obfuscate(
        &self,
        source: &Path,
        config: &ObfuscationConfig,
        workspace: &Path,
        timings: &mut BuildTimings,
    ) -> Result<PathBuf, StageFailure> {
        let original = fs::read(source)
            .map_err(|e| StageFailure::io(format!("Failed to read {source:?}"), e))?;
        let file_name = source
            .file_name()
            .map(OsString::from)
            .unwrap_or_else(|| OsString::from("source.c"));
        let prepared = workspace.join(file_name);
        let mut content = preamble(&self.settings.preamble, config).into_bytes();
        content.extend_from_slice(&original);
        fs::write(&prepared, content)
            .map_err(|e| StageFailure::io(format!("Failed to write {prepared:?}"), e))?;

        let output = workspace.join(format!("{}.c", artifact_stem(source, config.name())));
        let command = match &self.settings.tools.obfuscator {
            Some(prefix) => prefix.clone(),
            None => vec![config.invocation().to_string()],
        };
        let mut args: Vec<OsString> = controlled_arguments(config)
            .into_iter()
            .map(OsString::from)
            .collect();
        let mut out_arg = OsString::from(format!("{OUT_FLAG}="));
        out_arg.push(&output);
        args.push(out_arg);
        args.push(prepared.into_os_string());

        let timeout = self.settings.timeouts.obfuscate();
        let executor = CommandExecutor::new(CommandExecutorConfig {
            command,
            timeout,
            working_dir: Some(workspace.to_path_buf()),
        });
        debug!("Obfuscating '{}' with {args:?}", config.name());
        let execution = executor.execute_sync(&args);
        timings.obfuscate_seconds = Some(execution.output.elapsed.as_secs_f64());

        if let Some(failure) = StageFailure::from_execution(&execution, timeout) {
            return Err(failure);
        }
        if !output.is_file() {
            return Err(StageFailure::MissingArtifact { path: output });
        }
        Ok(output)
    }

    /// Compiles `source` into `executable`. `original` is the user's file,
    /// used as the reference for the compression distance.
    fn compile(
        &self,
        original: &Path,
        source: &Path,
        executable: &Path,
        timings: &mut BuildTimings,
    ) -> Result<CodeSize, StageFailure> {
        let timeout = self.settings.timeouts.compile();
        let executor = CommandExecutor::new(CommandExecutorConfig {
            command: self.settings.tools.compiler.clone(),
            timeout,
            working_dir: executable.parent().map(Path::to_path_buf),
        });
        let level = OsString::from(format!("-O{}", self.settings.run.optimization_level));
        let execution = executor.execute_sync(&[
            level.as_os_str(),
            source.as_os_str(),
            OsStr::new("-o"),
            executable.as_os_str(),
        ]);
        timings.compile_seconds = Some(execution.output.elapsed.as_secs_f64());

        if let Some(failure) = StageFailure::from_execution(&execution, timeout) {
            return Err(failure);
        }
        if !is_executable(executable) {
            return Err(StageFailure::MissingArtifact {
                path: executable.to_path_buf(),
            });
        }
        code_size(original, source, executable)
    }
}

/// `#include` block for the prepared source; empty without an obfuscator home.
///
/// Order: transform-specific headers, the obfuscator's default headers, then
/// system headers. Duplicates are written once.
pub fn preamble(settings: &PreambleSettings, config: &ObfuscationConfig) -> String {
    let Some(home) = &settings.obfuscator_home else {
        return String::new();
    };

    let mut lines: Vec<String> = Vec::new();
    let mut push = |line: String| {
        if !lines.contains(&line) {
            lines.push(line);
        }
    };

    for transform in requested_transforms(config) {
        for header in settings
            .transform_headers
            .get(&transform)
            .into_iter()
            .flatten()
        {
            push(format!("#include \"{}\"", home.join(header).display()));
        }
    }
    for header in &settings.default_headers {
        push(format!("#include \"{}\"", home.join(header).display()));
    }
    for header in &settings.system_headers {
        push(format!("#include <{header}>"));
    }

    let mut block = lines.join("\n");
    if !block.is_empty() {
        block.push('\n');
    }
    block
}

/// Lower-cased values of every `--Transform=` argument, in order.
fn requested_transforms(config: &ObfuscationConfig) -> impl Iterator<Item = String> + '_ {
    config.arguments().iter().filter_map(|arg| {
        arg.strip_prefix(TRANSFORM_FLAG)
            .map(|value| value.to_ascii_lowercase())
    })
}

/// The config's arguments without any output-path flag, which the builder
/// always supplies itself.
fn controlled_arguments(config: &ObfuscationConfig) -> Vec<String> {
    let mut kept = Vec::with_capacity(config.arguments().len());
    let mut args = config.arguments().iter().peekable();
    while let Some(arg) = args.next() {
        if arg == OUT_FLAG {
            let value = args.next_if(|next| !next.starts_with("--"));
            warn!(
                "'{}': ignoring `{arg} {}` from config",
                config.name(),
                value.map(String::as_str).unwrap_or_default()
            );
        } else if arg.starts_with(&format!("{OUT_FLAG}=")) {
            warn!("'{}': ignoring `{arg}` from config", config.name());
        } else {
            kept.push(arg.clone());
        }
    }
    kept
}

fn artifact_stem(source: &Path, label: &str) -> String {
    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "source".to_string());
    format!("{stem}-{label}")
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

fn code_size(original: &Path, source: &Path, executable: &Path) -> Result<CodeSize, StageFailure> {
    let content = fs::read(source)
        .map_err(|e| StageFailure::io(format!("Failed to read {source:?}"), e))?;
    let executable_bytes = fs::metadata(executable)
        .map_err(|e| StageFailure::io(format!("Failed to stat {executable:?}"), e))?
        .len();
    Ok(CodeSize {
        source_bytes: content.len() as u64,
        source_lines: content.split(|b| *b == b'\n').filter(|l| !l.is_empty()).count(),
        executable_bytes,
        compression_distance: compression_distance(original, &content),
    })
}

fn compression_distance(original: &Path, compiled: &[u8]) -> Option<f64> {
    let distance = fs::read(original)
        .and_then(|reference| normalized_compression_distance(&reference, compiled));
    match distance {
        Ok(distance) => Some(distance),
        Err(e) => {
            warn!("Compression distance against {original:?} unavailable: {e}");
            None
        }
    }
}
