//! Shared test infrastructure for integration tests.
//!
//! Each [`Sandbox`] runs `lassist` against a fixture under `tests/fixtures/`
//! with the mock LM script, its own config file, and its own mock state dir,
//! so tests can run in parallel.

use serde_json::Value;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// Retry settings small enough to keep failing fixtures fast.
const TEST_CONFIG: &str = r#"{
  "schema_version": 1,
  "invocation": {"timeout_ms": 5000, "max_retries": 2, "backoff_base_ms": 1}
}"#;

fn manifest_dir() -> PathBuf {
    PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".into()))
}

pub struct Sandbox {
    pub temp: TempDir,
    pub fixture_dir: PathBuf,
}

impl Sandbox {
    pub fn new(fixture: &str) -> Self {
        let fixture_dir = manifest_dir()
            .join("tests/fixtures")
            .join(fixture)
            .canonicalize()
            .expect("fixture dir exists");
        let temp = TempDir::new().expect("tempdir");
        fs::write(temp.path().join("config.json"), TEST_CONFIG).expect("write config");
        Self { temp, fixture_dir }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.temp.path().join(rel)
    }

    pub fn product(&self) -> PathBuf {
        self.fixture_dir.join("product.json")
    }

    fn state_dir(&self) -> PathBuf {
        self.path("mock-state")
    }

    fn lm_command(&self) -> String {
        let script = manifest_dir().join("tests/mock-lm.sh");
        shell_words::join([
            "sh".to_string(),
            script.display().to_string(),
            self.fixture_dir.display().to_string(),
        ])
    }

    /// `lassist` with the sandbox config, the mock LM, and a clean environment.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_lassist"));
        cmd.env("LISTING_ASSIST_CONFIG", self.path("config.json"))
            .env("LISTING_ASSIST_MOCK_STATE_DIR", self.state_dir())
            .env("LISTING_ASSIST_LOG", "warn")
            .env_remove("LISTING_ASSIST_LM_COMMAND")
            .arg("--lm")
            .arg(self.lm_command());
        cmd
    }

    pub fn run(&self, args: &[&str]) -> Output {
        self.command().args(args).output().expect("run lassist")
    }

    /// Run a subcommand that takes `--product`.
    pub fn run_product(&self, subcommand: &str, extra: &[&str]) -> Output {
        let product = self.product();
        let mut cmd = self.command();
        cmd.arg(subcommand).arg("--product").arg(&product).args(extra);
        cmd.output().expect("run lassist")
    }

    /// Model attempts the mock saw for `flow`.
    pub fn attempts(&self, flow: &str) -> u32 {
        fs::read_to_string(self.state_dir().join(format!("{flow}.attempts")))
            .ok()
            .and_then(|text| text.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Last prompt the mock received for `flow`.
    pub fn prompt(&self, flow: &str) -> Option<String> {
        fs::read_to_string(self.state_dir().join(format!("{flow}.prompt"))).ok()
    }
}

pub fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|err| {
        panic!(
            "stdout is not JSON ({err}); stdout={} stderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

pub fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "lassist failed ({:?}): {}",
        output.status.code(),
        String::from_utf8_lossy(&output.stderr)
    );
}

pub fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent directory");
    }
    fs::write(path, contents.as_bytes()).expect("write file");
}
