use crate::settings::BenchSettings;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{TempDir, tempdir};

pub const PROGRAM: &str = "int main(void)\n{\n    return 0; }\n";

pub fn test_target(name: &str) -> PathBuf {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    manifest_dir.join("../test_targets").join(name)
}

fn sh_command(script: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        test_target(script).to_string_lossy().into_owned(),
    ]
}

/// Writes a `fake_time.sh` plan, one invocation per line.
pub fn write_plan(dir: &Path, lines: &[&str]) -> PathBuf {
    let path = dir.join(format!("plan-{}.txt", lines.len()));
    let mut content = lines.join("\n");
    content.push('\n');
    fs::write(&path, content).unwrap();
    path
}

/// A scratch directory with a small C program and settings wired to the
/// fake tools in `test_targets/`.
pub struct TestBench {
    dir: TempDir,
    pub source: PathBuf,
    pub settings: BenchSettings,
}

impl TestBench {
    pub fn new() -> Self {
        let dir = tempdir().unwrap();
        let source = dir.path().join("prog.c");
        fs::write(&source, PROGRAM).unwrap();
        let default_plan = dir.path().join("default-plan.txt");
        fs::write(&default_plan, "0.010 1024 0 10 0\n").unwrap();

        let mut settings = BenchSettings::default();
        settings.tools.compiler = sh_command("fake_compiler.sh");
        settings.tools.obfuscator = Some(sh_command("fake_obfuscator.sh"));
        settings.tools.wrapper = sh_command("fake_time.sh");
        settings
            .tools
            .wrapper
            .push(default_plan.to_string_lossy().into_owned());
        settings.timeouts.obfuscate_ms = 10_000;
        settings.timeouts.compile_ms = 10_000;
        settings.timeouts.run_ms = 10_000;
        settings.timeouts.extract_ms = 10_000;
        settings.run.temp_root = Some(dir.path().to_path_buf());

        Self {
            dir,
            source,
            settings,
        }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn target(&self, name: &str) -> PathBuf {
        test_target(name)
    }

    pub fn use_wrapper_plan(&mut self, plan: &Path) {
        self.settings.tools.wrapper = sh_command("fake_time.sh");
        self.settings
            .tools
            .wrapper
            .push(plan.to_string_lossy().into_owned());
    }
}
