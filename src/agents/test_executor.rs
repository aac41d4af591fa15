use crate::agents::sandbox::{Sandbox, SandboxId, env_python};
use crate::error::{PkgupError, Result};
use crate::utils::process::{self, CancellationToken, ProcessOutput, Termination};
use crate::utils::walk::{ProjectWalker, file_name_matches};
use regex::Regex;
use serde::{Serialize, Serializer};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

/// Captured output kept per test run.
pub const CAPTURED_OUTPUT_LIMIT: usize = 64 * 1024;

static TEST_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:async\s+)?def\s+(test_\w*)\s*\(").expect("valid test function regex")
});

/// A test file found in the project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestEntry {
    pub path: PathBuf,
    pub relative: PathBuf,
    pub functions: Vec<String>,
}

pub trait TestDiscovery: Send + Sync {
    fn discover(&self, project_root: &Path) -> Result<Vec<TestEntry>>;
}

/// Finds `test_*.py` and `*_test.py` files
pub struct ConventionDiscovery {
    excluded_dirs: Vec<String>,
}

impl ConventionDiscovery {
    pub fn new(excluded_dirs: Vec<String>) -> Self {
        Self { excluded_dirs }
    }

    fn is_test_file(path: &Path) -> bool {
        file_name_matches(path, |name| {
            name.ends_with(".py") && (name.starts_with("test_") || name.ends_with("_test.py"))
        })
    }
}

impl TestDiscovery for ConventionDiscovery {
    fn discover(&self, project_root: &Path) -> Result<Vec<TestEntry>> {
        let walker = ProjectWalker::new(project_root).excluding(self.excluded_dirs.iter().cloned());

        let mut entries = Vec::new();
        for file in walker.files().filter(|e| Self::is_test_file(e.path())) {
            let source = match fs::read_to_string(file.path()) {
                Ok(source) => source,
                Err(e) => {
                    tracing::debug!(path = %file.path().display(), error = %e, "unreadable test file");
                    String::new()
                }
            };
            let functions = TEST_FUNCTION
                .captures_iter(&source)
                .map(|caps| caps[1].to_string())
                .collect();

            entries.push(TestEntry {
                path: file.path().to_path_buf(),
                relative: walker.relative(file.path()).to_path_buf(),
                functions,
            });
        }
        entries.sort_by(|a, b| a.relative.cmp(&b.relative));
        Ok(entries)
    }
}

/// Executes discovered test entries inside a sandbox
pub trait TestRunner: Send + Sync {
    fn run(
        &self,
        sandbox: &Sandbox,
        entries: &[TestEntry],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput>;
}

/// Runs the suite with `python -m pytest` from the sandbox environment.
pub struct PytestRunner {
    extra_args: Vec<String>,
}

impl PytestRunner {
    pub fn new(extra_args: Vec<String>) -> Self {
        Self { extra_args }
    }
}

impl TestRunner for PytestRunner {
    fn run(
        &self,
        sandbox: &Sandbox,
        entries: &[TestEntry],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput> {
        let mut command = Command::new(env_python(&sandbox.env_dir));
        command
            .current_dir(&sandbox.project_dir)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .args(["-m", "pytest", "-q", "-p", "no:cacheprovider"])
            .args(entries.iter().map(|e| &e.relative))
            .args(&self.extra_args);
        process::run_with_timeout(command, timeout, cancel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestWarning {
    NoTestsFound,
    TestsSkipped,
}

impl TestWarning {
    pub fn message(self) -> &'static str {
        match self {
            TestWarning::NoTestsFound => "no tests found",
            TestWarning::TestsSkipped => "tests skipped",
        }
    }
}

/// Outcome of running the suite once inside one sandbox
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestRun {
    pub sandbox_id: SandboxId,
    pub exit_status: Option<i32>,
    pub passed: bool,
    #[serde(rename = "duration_secs", serialize_with = "seconds")]
    pub duration: Duration,
    pub captured_output: String,
    pub warning: Option<TestWarning>,
    pub timed_out: bool,
    pub tests_discovered: usize,
}

fn seconds<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

impl TestRun {
    fn with_warning(sandbox: &Sandbox, warning: TestWarning, discovered: usize, duration: Duration) -> Self {
        Self {
            sandbox_id: sandbox.id,
            exit_status: None,
            passed: true,
            duration,
            captured_output: format!("WARNING: {}", warning.message()),
            warning: Some(warning),
            timed_out: false,
            tests_discovered: discovered,
        }
    }
}

/// TestExecutor discovers the project's tests in a sandbox and runs them there
pub struct TestExecutor {
    discovery: Arc<dyn TestDiscovery>,
    runner: Arc<dyn TestRunner>,
    timeout: Duration,
    skip_tests: bool,
}

impl TestExecutor {
    pub fn new(
        discovery: Arc<dyn TestDiscovery>,
        runner: Arc<dyn TestRunner>,
        timeout: Duration,
    ) -> Self {
        Self {
            discovery,
            runner,
            timeout,
            skip_tests: false,
        }
    }

    pub fn skip_tests(mut self, skip: bool) -> Self {
        self.skip_tests = skip;
        self
    }

    /// Run the suite in `sandbox`. A timeout is a failed run; a runner that
    /// cannot start, or a cancelled run, is an error.
    pub fn run(&self, sandbox: &Sandbox, cancel: &CancellationToken) -> Result<TestRun> {
        let started = Instant::now();

        if self.skip_tests {
            return Ok(TestRun::with_warning(
                sandbox,
                TestWarning::TestsSkipped,
                0,
                started.elapsed(),
            ));
        }

        let entries = self.discovery.discover(&sandbox.project_dir)?;
        if entries.is_empty() {
            tracing::warn!(sandbox = %sandbox.id, "no test entries discovered");
            return Ok(TestRun::with_warning(
                sandbox,
                TestWarning::NoTestsFound,
                0,
                started.elapsed(),
            ));
        }

        tracing::debug!(sandbox = %sandbox.id, entries = entries.len(), "running tests");
        let output = self.runner.run(sandbox, &entries, self.timeout, cancel)?;

        let mut captured = output.combined();
        let (passed, timed_out) = match output.termination {
            Termination::Cancelled => return Err(PkgupError::Cancelled),
            Termination::TimedOut => {
                let err = PkgupError::ExecutionTimeout(self.timeout);
                captured = format!("{captured}\n{err}").trim_start().to_string();
                (false, true)
            }
            Termination::Exited => (output.success, false),
        };

        Ok(TestRun {
            sandbox_id: sandbox.id,
            exit_status: output.exit_code,
            passed,
            duration: output.duration,
            captured_output: process::tail(&captured, CAPTURED_OUTPUT_LIMIT).to_string(),
            warning: None,
            timed_out,
            tests_discovered: entries.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::sandbox::{BaseEnvironment, Requirement, SandboxManager};
    use crate::agents::testing::{FakeDiscovery, FakeInstaller, FakeRunner};
    use tempfile::tempdir;

    fn with_sandbox(check: impl FnOnce(&Sandbox)) {
        let project = tempdir().unwrap();
        let work = tempdir().unwrap();
        let manager = SandboxManager::with_work_root(work.path(), Arc::new(FakeInstaller::new()));
        let base = BaseEnvironment {
            project_root: project.path().to_path_buf(),
            requirements_file: None,
            declared: vec![Requirement::pinned("requests", "2.0")],
            tooling: Vec::new(),
            excluded_dirs: Vec::new(),
        };
        let sandbox = manager
            .provision(&base, &[], &CancellationToken::new())
            .unwrap();
        check(&sandbox);
        manager.teardown(sandbox).unwrap();
    }

    fn executor(discovery: FakeDiscovery, runner: FakeRunner) -> TestExecutor {
        TestExecutor::new(Arc::new(discovery), Arc::new(runner), Duration::from_secs(5))
    }

    #[test]
    fn discovers_conventional_test_files() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("tests/unit")).unwrap();
        fs::create_dir_all(root.join(".venv")).unwrap();
        fs::write(
            root.join("tests/unit/test_models.py"),
            "def test_create():\n    pass\n\nasync def test_async():\n    pass\n\ndef helper():\n    pass\n",
        )
        .unwrap();
        fs::write(root.join("tests/api_test.py"), "def test_get(): pass\n").unwrap();
        fs::write(root.join("tests/conftest.py"), "").unwrap();
        fs::write(root.join(".venv/test_hidden.py"), "").unwrap();

        let entries = ConventionDiscovery::new(Vec::new()).discover(root).unwrap();
        let relative: Vec<PathBuf> = entries.iter().map(|e| e.relative.clone()).collect();
        assert_eq!(
            relative,
            vec![
                PathBuf::from("tests/api_test.py"),
                PathBuf::from("tests/unit/test_models.py")
            ]
        );
        assert_eq!(entries[1].functions, vec!["test_create", "test_async"]);
    }

    #[test]
    fn zero_tests_pass_with_warning() {
        with_sandbox(|sandbox| {
            let run = executor(FakeDiscovery::empty(), FakeRunner::new())
                .run(sandbox, &CancellationToken::new())
                .unwrap();
            assert!(run.passed);
            assert_eq!(run.warning, Some(TestWarning::NoTestsFound));
            assert!(run.captured_output.contains("no tests found"));
        });
    }

    #[test]
    fn failing_suite_fails_the_run() {
        with_sandbox(|sandbox| {
            let runner = FakeRunner::new().failing_when("requests==2.0");
            let run = executor(FakeDiscovery::single("tests/test_app.py"), runner)
                .run(sandbox, &CancellationToken::new())
                .unwrap();
            assert!(!run.passed);
            assert_eq!(run.exit_status, Some(1));
            assert_eq!(run.warning, None);
            assert_eq!(run.tests_discovered, 1);
        });
    }

    #[test]
    fn timeout_is_a_failed_run_not_an_error() {
        with_sandbox(|sandbox| {
            let runner = FakeRunner::new().timing_out_when("requests==2.0");
            let run = executor(FakeDiscovery::single("tests/test_app.py"), runner)
                .run(sandbox, &CancellationToken::new())
                .unwrap();
            assert!(!run.passed);
            assert!(run.timed_out);
            assert!(run.captured_output.contains("timed out"));
        });
    }

    #[test]
    fn runner_crash_is_an_error() {
        with_sandbox(|sandbox| {
            let runner = FakeRunner::new().crashing_when("requests==2.0");
            let err = executor(FakeDiscovery::single("tests/test_app.py"), runner)
                .run(sandbox, &CancellationToken::new())
                .unwrap_err();
            assert!(matches!(err, PkgupError::Execution(_)));
        });
    }

    #[test]
    fn skip_mode_never_invokes_runner() {
        with_sandbox(|sandbox| {
            let runner = Arc::new(FakeRunner::new().crashing_when("requests==2.0"));
            let run = TestExecutor::new(
                Arc::new(FakeDiscovery::single("tests/test_app.py")),
                runner.clone(),
                Duration::from_secs(5),
            )
            .skip_tests(true)
            .run(sandbox, &CancellationToken::new())
            .unwrap();
            assert!(run.passed);
            assert_eq!(run.warning, Some(TestWarning::TestsSkipped));
            assert_eq!(runner.invocations(), 0);
        });
    }
}
