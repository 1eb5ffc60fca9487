mod render;

use anyhow::Context;
use clap::Parser;
use obfperf_core::loader::load_configs;
use obfperf_core::pipeline::Benchmark;
use obfperf_core::settings::BenchSettings;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_SETTINGS_FILE: &str = "obfperf.toml";
const RESULT_FILE: &str = "comparison.json";
const OBFUSCATOR_HOME_ENV: &str = "TIGRESS_HOME";

#[derive(Parser, Debug)]
#[clap(author, version, about = "Benchmark obfuscation configs against an unmodified baseline", long_about = None)]
struct Cli {
    /// C source file to obfuscate and measure.
    #[clap(value_parser)]
    source_code: PathBuf,
    /// Config files or directories of config files, compared in this order.
    #[clap(value_parser, required = true)]
    obf_configs: Vec<PathBuf>,
    /// Directory receiving comparison.json.
    #[clap(short, long, value_parser, default_value = ".")]
    output_dir: PathBuf,
    #[clap(short, long)]
    runs: Option<u32>,
    #[clap(short, long)]
    warmups: Option<u32>,
    /// Compiler optimization level (0-3).
    #[clap(short = 'O', long = "opt-level")]
    optimization_level: Option<u8>,
    /// Variants built concurrently. Measurement is always sequential.
    #[clap(short, long)]
    jobs: Option<usize>,
    #[clap(short, long, value_parser)]
    settings: Option<PathBuf>,
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_settings(cli: &Cli) -> Result<BenchSettings, anyhow::Error> {
    let mut settings = match &cli.settings {
        Some(path) => {
            info!("Loading settings from {path:?}");
            BenchSettings::load_from_file(path)?
        }
        None => {
            let default_path = PathBuf::from(DEFAULT_SETTINGS_FILE);
            if default_path.exists() {
                info!("Loading settings from {default_path:?}");
                BenchSettings::load_from_file(&default_path)?
            } else {
                debug!("No {DEFAULT_SETTINGS_FILE} found, using built-in defaults");
                BenchSettings::default()
            }
        }
    };

    if let Some(runs) = cli.runs {
        settings.run.runs = runs;
    }
    if let Some(warmups) = cli.warmups {
        settings.run.warmups = warmups;
    }
    if let Some(level) = cli.optimization_level {
        settings.run.optimization_level = level;
    }
    if let Some(jobs) = cli.jobs {
        settings.run.jobs = jobs;
    }
    if settings.preamble.obfuscator_home.is_none() {
        settings.preamble.obfuscator_home = std::env::var_os(OBFUSCATOR_HOME_ENV).map(PathBuf::from);
    }

    settings.validate()?;
    match toml::to_string(&settings) {
        Ok(effective) => debug!("Effective settings:\n{effective}"),
        Err(e) => warn!("Could not render effective settings: {e}"),
    }
    Ok(settings)
}

fn write_result(path: &Path, result: &obfperf_core::ComparisonResult) -> Result<(), anyhow::Error> {
    let file = File::create(path).with_context(|| format!("Failed to create {path:?}"))?;
    serde_json::to_writer_pretty(BufWriter::new(file), result)
        .with_context(|| format!("Failed to write {path:?}"))?;
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings = load_settings(&cli)?;
    let loaded = load_configs(&cli.obf_configs);
    if loaded.is_empty() {
        warn!("No usable obfuscation configs; only the baseline will be measured");
    }

    let benchmark = Benchmark::new(settings, &cli.output_dir);
    let result = benchmark
        .run(&cli.source_code, loaded)
        .with_context(|| format!("Benchmark of {:?} aborted", cli.source_code))?;

    let result_path = cli.output_dir.join(RESULT_FILE);
    write_result(&result_path, &result)?;
    info!("Comparison written to {result_path:?}");

    print!("{}", render::render_table(&result));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_parse() {
        let cli = Cli::try_parse_from([
            "obfperf", "prog.c", "configs/", "extra.txt", "-r", "5", "-w", "2", "-O", "2", "-j",
            "4", "-vv",
        ])
        .unwrap();
        assert_eq!(cli.source_code, PathBuf::from("prog.c"));
        assert_eq!(cli.obf_configs.len(), 2);
        assert_eq!(cli.runs, Some(5));
        assert_eq!(cli.warmups, Some(2));
        assert_eq!(cli.optimization_level, Some(2));
        assert_eq!(cli.jobs, Some(4));
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.output_dir, PathBuf::from("."));
    }

    #[test]
    fn configs_are_required() {
        assert!(Cli::try_parse_from(["obfperf", "prog.c"]).is_err());
    }

    #[test]
    fn flags_override_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings_path = dir.path().join("bench.toml");
        std::fs::write(
            &settings_path,
            "[run]\nruns = 10\nwarmups = 3\n\n[tools]\ncompiler = [\"clang\"]\n",
        )
        .unwrap();
        let settings_arg = settings_path.to_string_lossy().into_owned();
        let cli = Cli::try_parse_from([
            "obfperf",
            "prog.c",
            "a.txt",
            "--settings",
            settings_arg.as_str(),
            "-r",
            "4",
        ])
        .unwrap();

        let settings = load_settings(&cli).unwrap();
        assert_eq!(settings.run.runs, 4);
        assert_eq!(settings.run.warmups, 3);
        assert_eq!(settings.tools.compiler, vec!["clang"]);
    }

    #[test]
    fn invalid_override_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let settings_path = dir.path().join("bench.toml");
        std::fs::write(&settings_path, "").unwrap();
        let settings_arg = settings_path.to_string_lossy().into_owned();
        let cli = Cli::try_parse_from([
            "obfperf",
            "prog.c",
            "a.txt",
            "-O",
            "7",
            "-s",
            settings_arg.as_str(),
        ])
        .unwrap();
        assert!(load_settings(&cli).is_err());
    }
}
