use crate::error::{PkgupError, Result};
use crate::manifest::{Manifest, ManifestKind, normalize_name, requirements};
use crate::utils::process::{self, CancellationToken, Termination};
use crate::utils::ProjectWalker;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub use crate::manifest::Requirement;

const OUTPUT_TAIL_BYTES: usize = 4 * 1024;
const DEFAULT_PROVISION_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SandboxId(u64);

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sbx-{}", self.0)
    }
}

fn same_package(a: &str, b: &str) -> bool {
    normalize_name(a) == normalize_name(b)
}

/// The project's normal dependency set, shared read-only by every trial.
#[derive(Debug, Clone)]
pub struct BaseEnvironment {
    pub project_root: PathBuf,
    /// Requirements file, relative to the project, installed with `pip install -r`
    /// after the candidate pins are written into the sandbox copy.
    pub requirements_file: Option<PathBuf>,
    /// Declared dependencies.
    pub declared: Vec<Requirement>,
    /// Test tooling the manifest does not declare.
    pub tooling: Vec<Requirement>,
    /// Directory names left out of the sandbox copy of the project.
    pub excluded_dirs: Vec<String>,
}

impl BaseEnvironment {
    /// A requirements.txt is installed as a file so includes, editable and
    /// VCS lines, extras and markers behave as they do for the project. A
    /// Pipfile is installed entry by entry.
    pub fn for_manifest(
        project_root: &Path,
        manifest: &Manifest,
        test_requirements: &[String],
        excluded_dirs: Vec<String>,
    ) -> Result<Self> {
        let requirements_file = match manifest.kind {
            ManifestKind::Requirements => Some(match manifest.path.strip_prefix(project_root) {
                Ok(relative) => relative.to_path_buf(),
                Err(_) => PathBuf::from(manifest.path.file_name().unwrap_or_default()),
            }),
            ManifestKind::Pipfile => None,
        };

        let tooling = test_requirements
            .iter()
            .filter(|tool| manifest.get(tool).is_none())
            .map(|tool| Requirement::new(tool.as_str()))
            .collect();

        Ok(Self {
            project_root: project_root.to_path_buf(),
            requirements_file,
            declared: manifest.install_requirements()?,
            tooling,
            excluded_dirs,
        })
    }

    fn is_declared(&self, name: &str) -> bool {
        self.declared.iter().any(|r| same_package(&r.name, name))
    }

    /// Declared dependencies and tooling, with `overrides` replacing
    /// same-named entries and appended when nothing matches.
    pub fn merged(&self, overrides: &[Requirement]) -> Vec<Requirement> {
        let mut merged: Vec<Requirement> = self
            .declared
            .iter()
            .chain(&self.tooling)
            .map(|base| {
                overrides
                    .iter()
                    .find(|o| same_package(&o.name, &base.name))
                    .map_or_else(|| base.clone(), |o| base.overridden_by(o))
            })
            .collect();

        for extra in overrides {
            if !merged.iter().any(|r| same_package(&r.name, &extra.name)) {
                merged.push(extra.clone());
            }
        }
        merged
    }

    /// Work out what a sandbox installs. With a requirements file, the copy in
    /// `project_dir` is rewritten with the overriding pins first.
    pub fn install_plan(&self, project_dir: &Path, overrides: &[Requirement]) -> Result<InstallPlan> {
        let Some(relative) = &self.requirements_file else {
            return Ok(InstallPlan {
                requirements_file: None,
                requirements: self.merged(overrides),
            });
        };

        let pins: BTreeMap<String, String> = overrides
            .iter()
            .filter(|o| self.is_declared(&o.name))
            .filter_map(|o| Some((normalize_name(&o.name), o.exact_version()?.to_string())))
            .collect();
        let path = project_dir.join(relative);
        let content = fs::read_to_string(&path)?;
        fs::write(&path, requirements::rewrite(&content, &pins)?)?;

        Ok(InstallPlan {
            requirements_file: Some(path),
            requirements: self
                .merged(overrides)
                .into_iter()
                .filter(|r| !self.is_declared(&r.name))
                .collect(),
        })
    }
}

/// What one sandbox installs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallPlan {
    /// Requirements file inside the sandbox copy, already carrying the candidate pins.
    pub requirements_file: Option<PathBuf>,
    pub requirements: Vec<Requirement>,
}

impl InstallPlan {
    pub fn is_empty(&self) -> bool {
        self.requirements_file.is_none() && self.requirements.is_empty()
    }

    pub fn install_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(file) = &self.requirements_file {
            args.push("-r".to_string());
            args.push(file.to_string_lossy().into_owned());
        }
        args.extend(self.requirements.iter().flat_map(Requirement::install_args));
        args
    }
}

/// A disposable copy of the project with its own environment. Dropping the
/// sandbox deletes its directory; the manager's `teardown` does so explicitly.
#[derive(Debug)]
pub struct Sandbox {
    pub id: SandboxId,
    root: TempDir,
    pub project_dir: PathBuf,
    pub env_dir: PathBuf,
    /// Requested version per package (normalised name): the exact pin, the
    /// specifier when there is none, or the source of a path/VCS install.
    pub installed_set: BTreeMap<String, String>,
}

impl Sandbox {
    pub fn root_path(&self) -> &Path {
        self.root.path()
    }
}

/// Capability for creating environments and installing packages into them.
/// Both steps of one provisioning share `deadline`.
pub trait Installer: Send + Sync {
    fn create_environment(
        &self,
        sandbox: &Sandbox,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<()>;

    fn install(
        &self,
        sandbox: &Sandbox,
        plan: &InstallPlan,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Interpreter inside a virtual environment.
pub fn env_python(env_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        env_dir.join("Scripts").join("python.exe")
    } else {
        env_dir.join("bin").join("python")
    }
}

/// Installer backed by `python -m venv` and `pip`
pub struct VenvInstaller {
    python: String,
}

impl VenvInstaller {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
        }
    }

    fn run(
        &self,
        command: Command,
        what: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(PkgupError::SandboxProvision(format!(
                "{what}: provisioning time limit reached"
            )));
        }

        let output = process::run_with_timeout(command, remaining, cancel)
            .map_err(|e| PkgupError::SandboxProvision(format!("{what}: {e}")))?;

        match output.termination {
            Termination::Cancelled => Err(PkgupError::Cancelled),
            Termination::TimedOut => Err(PkgupError::SandboxProvision(format!(
                "{what} timed out ({}s of provisioning time left)",
                remaining.as_secs()
            ))),
            Termination::Exited if output.success => Ok(()),
            Termination::Exited => Err(PkgupError::SandboxProvision(format!(
                "{what} failed (exit code {}):\n{}",
                output.exit_code.unwrap_or(-1),
                process::tail(&output.combined(), OUTPUT_TAIL_BYTES)
            ))),
        }
    }
}

impl Installer for VenvInstaller {
    fn create_environment(
        &self,
        sandbox: &Sandbox,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut command = Command::new(&self.python);
        command.arg("-m").arg("venv").arg(&sandbox.env_dir);
        self.run(command, "creating virtual environment", deadline, cancel)
    }

    fn install(
        &self,
        sandbox: &Sandbox,
        plan: &InstallPlan,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if plan.is_empty() {
            return Ok(());
        }
        let mut command = Command::new(env_python(&sandbox.env_dir));
        command
            .current_dir(&sandbox.project_dir)
            .args(["-m", "pip", "install", "--disable-pip-version-check", "--no-input"])
            .args(plan.install_args());
        self.run(command, "pip install", deadline, cancel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SandboxStats {
    pub provisioned: usize,
    pub torn_down: usize,
}

/// Creates and destroys per-trial sandboxes. Live sandboxes are tracked by id
/// so anything still registered at shutdown can be removed.
pub struct SandboxManager {
    work_root: PathBuf,
    installer: Arc<dyn Installer>,
    next_id: AtomicU64,
    live: Mutex<BTreeMap<SandboxId, PathBuf>>,
    provisioned: AtomicUsize,
    torn_down: AtomicUsize,
    provision_timeout: Duration,
}

impl SandboxManager {
    pub fn new(installer: Arc<dyn Installer>) -> Self {
        Self::with_work_root(std::env::temp_dir(), installer)
    }

    pub fn with_work_root<P: AsRef<Path>>(
        work_root: P,
        installer: Arc<dyn Installer>,
    ) -> Self {
        Self {
            work_root: work_root.as_ref().to_path_buf(),
            installer,
            next_id: AtomicU64::new(1),
            live: Mutex::new(BTreeMap::new()),
            provisioned: AtomicUsize::new(0),
            torn_down: AtomicUsize::new(0),
            provision_timeout: DEFAULT_PROVISION_TIMEOUT,
        }
    }

    /// Time allowed for one whole provisioning: environment plus installs.
    pub fn provision_timeout(mut self, timeout: Duration) -> Self {
        self.provision_timeout = timeout;
        self
    }

    /// Build a sandbox holding a copy of the project and the base dependency
    /// set with `overrides` applied. On failure nothing is left behind.
    pub fn provision(
        &self,
        base: &BaseEnvironment,
        overrides: &[Requirement],
        cancel: &CancellationToken,
    ) -> Result<Sandbox> {
        if cancel.is_cancelled() {
            return Err(PkgupError::Cancelled);
        }

        let id = SandboxId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let root = tempfile::Builder::new()
            .prefix(&format!("pkgup-{}-", id.0))
            .tempdir_in(&self.work_root)
            .map_err(|e| PkgupError::SandboxProvision(format!("creating {id}: {e}")))?;

        let sandbox = Sandbox {
            id,
            project_dir: root.path().join("project"),
            env_dir: root.path().join("env"),
            installed_set: base
                .merged(overrides)
                .iter()
                .map(|r| (normalize_name(&r.name), r.requested_version().to_string()))
                .collect(),
            root,
        };

        self.register(&sandbox);
        tracing::debug!(sandbox = %id, root = %sandbox.root_path().display(), "provisioning sandbox");

        let deadline = Instant::now() + self.provision_timeout;
        let populated = copy_project(base, &sandbox.project_dir)
            .and_then(|()| base.install_plan(&sandbox.project_dir, overrides))
            .and_then(|plan| {
                self.installer.create_environment(&sandbox, deadline, cancel)?;
                self.installer.install(&sandbox, &plan, deadline, cancel)
            });

        match populated {
            Ok(()) => Ok(sandbox),
            Err(err) => {
                if let Err(teardown_err) = self.teardown(sandbox) {
                    tracing::warn!(sandbox = %id, error = %teardown_err, "teardown after failed provisioning");
                }
                Err(match err {
                    PkgupError::Cancelled | PkgupError::SandboxProvision(_) => err,
                    other => PkgupError::SandboxProvision(other.to_string()),
                })
            }
        }
    }

    /// Release everything the sandbox holds. Consumes the sandbox, so each
    /// provisioned sandbox can be torn down only once.
    pub fn teardown(&self, sandbox: Sandbox) -> Result<()> {
        let id = sandbox.id;
        self.unregister(id);
        self.torn_down.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(sandbox = %id, "tearing down sandbox");
        sandbox.root.close().map_err(PkgupError::Io)
    }

    /// Remove any sandbox directory still registered. Returns how many were removed.
    pub fn teardown_all(&self) -> usize {
        let orphans: Vec<(SandboxId, PathBuf)> = match self.live.lock() {
            Ok(mut live) => std::mem::take(&mut *live).into_iter().collect(),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()).into_iter().collect(),
        };

        for (id, path) in &orphans {
            tracing::warn!(sandbox = %id, "removing orphaned sandbox");
            if let Err(e) = fs::remove_dir_all(path) {
                tracing::warn!(sandbox = %id, error = %e, "failed to remove orphaned sandbox");
            }
        }
        orphans.len()
    }

    pub fn active_count(&self) -> usize {
        self.live.lock().map(|live| live.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> SandboxStats {
        SandboxStats {
            provisioned: self.provisioned.load(Ordering::SeqCst),
            torn_down: self.torn_down.load(Ordering::SeqCst),
        }
    }

    fn register(&self, sandbox: &Sandbox) {
        self.provisioned.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut live) = self.live.lock() {
            live.insert(sandbox.id, sandbox.root_path().to_path_buf());
        }
    }

    fn unregister(&self, id: SandboxId) {
        if let Ok(mut live) = self.live.lock() {
            live.remove(&id);
        }
    }
}

/// Scoped ownership of a provisioned sandbox: teardown runs on `release`
/// or, failing that, when the lease is dropped (including during unwinding).
pub struct SandboxLease<'a> {
    manager: &'a SandboxManager,
    sandbox: Option<Sandbox>,
}

impl<'a> SandboxLease<'a> {
    pub fn new(manager: &'a SandboxManager, sandbox: Sandbox) -> Self {
        Self {
            manager,
            sandbox: Some(sandbox),
        }
    }

    pub fn release(mut self) -> Result<()> {
        match self.sandbox.take() {
            Some(sandbox) => self.manager.teardown(sandbox),
            None => Ok(()),
        }
    }
}

impl Deref for SandboxLease<'_> {
    type Target = Sandbox;

    fn deref(&self) -> &Sandbox {
        self.sandbox
            .as_ref()
            .expect("sandbox is present until the lease is released")
    }
}

impl Drop for SandboxLease<'_> {
    fn drop(&mut self) {
        if let Some(sandbox) = self.sandbox.take() {
            let id = sandbox.id;
            if let Err(e) = self.manager.teardown(sandbox) {
                tracing::warn!(sandbox = %id, error = %e, "sandbox teardown failed");
            }
        }
    }
}

fn copy_project(base: &BaseEnvironment, destination: &Path) -> Result<()> {
    let walker = ProjectWalker::new(&base.project_root).excluding(base.excluded_dirs.iter().cloned());
    fs::create_dir_all(destination)?;

    for entry in walker.entries() {
        let target = destination.join(walker.relative(entry.path()));
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        } else {
            tracing::debug!(path = %entry.path().display(), "not copying special file");
        }
    }
    Ok(())
}
