use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Lines starting with this character (after leading whitespace) are ignored.
pub const COMMENT_PREFIX: char = '#';

/// Trailing marker that joins a physical line to the next one. It carries no
/// meaning beyond readability, so it is simply dropped.
pub const LINE_CONTINUATION: &str = "\\";

/// Errors raised while turning a descriptor file into an [`ObfuscationConfig`].
///
/// A parse error is fatal for that one descriptor only; the caller records it
/// and moves on to the next one.
#[derive(Error, Debug)]
pub enum ConfigParseError {
    #[error("Failed to read obfuscation config {path:?}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to list obfuscation config directory {path:?}: {source}")]
    UnreadableDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Obfuscation config {0:?} contains no tokens after stripping comments")]
    Empty(PathBuf),
}

/// One transformation recipe: the descriptor it came from and the ordered
/// token stream to hand to the obfuscator.
///
/// The first token is the invocation name (e.g. `tigress`), the rest are the
/// transformation arguments. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObfuscationConfig {
    name: String,
    path: PathBuf,
    tokens: Vec<String>,
}

impl ObfuscationConfig {
    /// Builds a config from already tokenized content. `tokens` must not be empty.
    pub fn new(path: impl Into<PathBuf>, tokens: Vec<String>) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self { name, path, tokens }
    }

    /// Display name: the descriptor's file stem.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn invocation(&self) -> &str {
        self.tokens.first().map(String::as_str).unwrap_or_default()
    }

    pub fn arguments(&self) -> &[String] {
        self.tokens.get(1..).unwrap_or_default()
    }

    /// Hex MD5 of the descriptor path and token stream, stable across runs.
    pub fn fingerprint(&self) -> String {
        let mut material = self.path.to_string_lossy().into_owned().into_bytes();
        for token in &self.tokens {
            material.push(0);
            material.extend_from_slice(token.as_bytes());
        }
        format!("{:x}", md5::compute(&material))
    }
}

/// A descriptor that could not be loaded, kept so it never silently vanishes
/// from the comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedConfig {
    pub path: PathBuf,
    pub reason: String,
}

/// Everything produced by [`load_configs`], in the order the user supplied.
#[derive(Debug, Default)]
pub struct LoadedConfigs {
    pub configs: Vec<Arc<ObfuscationConfig>>,
    pub rejected: Vec<RejectedConfig>,
}

impl LoadedConfigs {
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

/// Splits descriptor text into tokens.
///
/// Grammar: tokens are separated by any whitespace, including newlines; blank
/// lines and `#` comment lines are skipped; a `\` ending a physical line (or
/// standing alone as a token) is dropped. Quoting is not supported.
pub fn parse_tokens(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(COMMENT_PREFIX))
        .flat_map(|line| {
            line.strip_suffix(LINE_CONTINUATION)
                .unwrap_or(line)
                .split_whitespace()
        })
        .filter(|token| *token != LINE_CONTINUATION)
        .map(str::to_string)
        .collect()
}

/// Loads a single descriptor file.
pub fn load_config_file(path: &Path) -> Result<ObfuscationConfig, ConfigParseError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigParseError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;

    let tokens = parse_tokens(&content);
    if tokens.is_empty() {
        return Err(ConfigParseError::Empty(path.to_path_buf()));
    }
    Ok(ObfuscationConfig::new(path, tokens))
}

/// Resolves a user-supplied path into the descriptor files it denotes.
///
/// A directory yields its regular, non-hidden files sorted by file name, so the
/// resulting order is reproducible. Anything else is taken as a single file.
pub fn discover_config_files(path: &Path) -> Result<Vec<PathBuf>, ConfigParseError> {
    if !path.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }

    let list_err = |source| ConfigParseError::UnreadableDirectory {
        path: path.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in fs::read_dir(path).map_err(list_err)? {
        let entry = entry.map_err(list_err)?;
        let file_path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if file_path.is_file() && !hidden {
            files.push(file_path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// Loads every descriptor named by `paths`, concatenated in argument order.
///
/// Failures are collected into [`LoadedConfigs::rejected`] instead of aborting.
pub fn load_configs(paths: &[PathBuf]) -> LoadedConfigs {
    let mut loaded = LoadedConfigs::default();

    for path in paths {
        let files = match discover_config_files(path) {
            Ok(files) => files,
            Err(e) => {
                warn!("Skipping {path:?}: {e}");
                loaded.rejected.push(RejectedConfig {
                    path: path.clone(),
                    reason: e.to_string(),
                });
                continue;
            }
        };

        for file in files {
            match load_config_file(&file) {
                Ok(config) => {
                    debug!(
                        "Loaded obfuscation config '{}' ({} tokens)",
                        config.name(),
                        config.tokens().len()
                    );
                    loaded.configs.push(Arc::new(config));
                }
                Err(e) => {
                    warn!("Rejecting obfuscation config: {e}");
                    loaded.rejected.push(RejectedConfig {
                        path: file,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    loaded
}
