//! In-memory stand-ins for the index, installer, discovery and runner.

use crate::agents::sandbox::{InstallPlan, Installer, Sandbox};
use crate::agents::test_executor::{TestDiscovery, TestEntry, TestRunner};
use crate::error::{PkgupError, Result};
use crate::index::PackageIndex;
use crate::manifest::{Constraint, Dependency, ManifestKind, normalize_name};
use crate::utils::process::{CancellationToken, ProcessOutput, Termination};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub fn dependency(name: &str, spec: &str) -> Dependency {
    Dependency {
        name: name.to_string(),
        current_constraint: Constraint::parse(spec).unwrap_or_else(Constraint::unpinned),
        source: ManifestKind::Requirements,
    }
}

#[derive(Default)]
pub struct FakeIndex {
    versions: HashMap<String, Vec<String>>,
    failures: Mutex<HashMap<String, usize>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl FakeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_versions(mut self, name: &str, versions: &[&str]) -> Self {
        self.versions.insert(
            normalize_name(name),
            versions.iter().map(|v| v.to_string()).collect(),
        );
        self
    }

    /// The next `times` queries for `name` fail as an outage.
    pub fn failing_times(self, name: &str, times: usize) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(normalize_name(name), times);
        self
    }

    pub fn calls(&self, name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(&normalize_name(name))
            .copied()
            .unwrap_or(0)
    }
}

impl PackageIndex for FakeIndex {
    fn list_versions(&self, name: &str) -> Result<Vec<String>> {
        let key = normalize_name(name);
        *self.calls.lock().unwrap().entry(key.clone()).or_default() += 1;

        if let Some(remaining) = self.failures.lock().unwrap().get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(PkgupError::IndexUnavailable(format!("{name}: connection reset")));
            }
        }

        self.versions
            .get(&key)
            .cloned()
            .ok_or_else(|| PkgupError::PackageNotFound(name.to_string()))
    }
}

/// Records every requirement line it is asked to install.
#[derive(Default)]
pub struct FakeInstaller {
    failing: Vec<String>,
    installed: Mutex<Vec<String>>,
    deadlines: Mutex<Vec<Instant>>,
}

impl FakeInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(mut self, spec: &str) -> Self {
        self.failing.push(spec.to_string());
        self
    }

    pub fn installed(&self) -> Vec<String> {
        self.installed.lock().unwrap().clone()
    }

    pub fn deadlines(&self) -> Vec<Instant> {
        self.deadlines.lock().unwrap().clone()
    }
}

impl Installer for FakeInstaller {
    fn create_environment(
        &self,
        sandbox: &Sandbox,
        deadline: Instant,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.deadlines.lock().unwrap().push(deadline);
        fs::create_dir_all(&sandbox.env_dir)?;
        Ok(())
    }

    fn install(
        &self,
        _sandbox: &Sandbox,
        plan: &InstallPlan,
        deadline: Instant,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.deadlines.lock().unwrap().push(deadline);

        let mut lines = Vec::new();
        if let Some(file) = &plan.requirements_file {
            lines.extend(
                fs::read_to_string(file)?
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(str::to_string),
            );
        }
        lines.extend(plan.requirements.iter().map(ToString::to_string));

        if let Some(spec) = lines.iter().find(|line| self.failing.contains(line)) {
            return Err(PkgupError::SandboxProvision(format!(
                "no matching distribution found for {spec}"
            )));
        }
        self.installed.lock().unwrap().extend(lines);
        Ok(())
    }
}

/// Reports the same entries for every project root.
pub struct FakeDiscovery {
    entries: Vec<PathBuf>,
}

impl FakeDiscovery {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn single(relative: &str) -> Self {
        Self {
            entries: vec![PathBuf::from(relative)],
        }
    }
}

impl TestDiscovery for FakeDiscovery {
    fn discover(&self, project_root: &Path) -> Result<Vec<TestEntry>> {
        Ok(self
            .entries
            .iter()
            .map(|relative| TestEntry {
                path: project_root.join(relative),
                relative: relative.clone(),
                functions: vec!["test_it".to_string()],
            })
            .collect())
    }
}

/// Decides the outcome from the `name==version` pins in the sandbox.
#[derive(Default)]
pub struct FakeRunner {
    failing: Vec<String>,
    timing_out: Vec<String>,
    crashing: Vec<String>,
    interrupting: Option<CancellationToken>,
    invocations: AtomicUsize,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_when(mut self, spec: &str) -> Self {
        self.failing.push(spec.to_string());
        self
    }

    pub fn timing_out_when(mut self, spec: &str) -> Self {
        self.timing_out.push(spec.to_string());
        self
    }

    pub fn crashing_when(mut self, spec: &str) -> Self {
        self.crashing.push(spec.to_string());
        self
    }

    /// Cancel `token` while the first suite runs, as Ctrl-C would.
    pub fn interrupting(mut self, token: CancellationToken) -> Self {
        self.interrupting = Some(token);
        self
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl TestRunner for FakeRunner {
    fn run(
        &self,
        sandbox: &Sandbox,
        entries: &[TestEntry],
        timeout: Duration,
        _cancel: &CancellationToken,
    ) -> Result<ProcessOutput> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let installed = |specs: &[String]| {
            sandbox
                .installed_set
                .iter()
                .any(|(name, version)| specs.contains(&format!("{name}=={version}")))
        };

        if let Some(token) = &self.interrupting {
            token.cancel();
            return Ok(ProcessOutput {
                exit_code: None,
                success: false,
                stdout: String::new(),
                stderr: String::new(),
                duration: Duration::from_millis(10),
                termination: Termination::Cancelled,
            });
        }

        if installed(&self.crashing) {
            return Err(PkgupError::Execution("Failed to spawn 'python': not found".into()));
        }

        let (termination, exit_code, stdout) = if installed(&self.timing_out) {
            (Termination::TimedOut, None, String::new())
        } else if installed(&self.failing) {
            (
                Termination::Exited,
                Some(1),
                format!("FAILED {} - AssertionError", entries[0].relative.display()),
            )
        } else {
            (
                Termination::Exited,
                Some(0),
                format!("{} passed", entries.len()),
            )
        };

        Ok(ProcessOutput {
            exit_code,
            success: exit_code == Some(0),
            stdout,
            stderr: String::new(),
            duration: if termination == Termination::TimedOut {
                timeout
            } else {
                Duration::from_millis(10)
            },
            termination,
        })
    }
}
