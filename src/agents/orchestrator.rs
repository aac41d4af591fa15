use crate::agents::sandbox::{BaseEnvironment, Requirement, SandboxLease, SandboxManager};
use crate::agents::test_executor::{TestExecutor, TestRun, TestWarning};
use crate::agents::version_resolver::{UpdateCandidate, UpdatePolicy, VersionResolver};
use crate::error::{PkgupError, Result};
use crate::manifest::{Dependency, Manifest};
use crate::utils::process::CancellationToken;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// Lifecycle of one candidate trial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    Pending,
    Provisioning,
    Testing,
    Accepted,
    Rejected,
    Error,
    TornDown,
}

impl TrialState {
    pub fn can_transition_to(self, next: TrialState) -> bool {
        use TrialState::*;
        matches!(
            (self, next),
            (Pending, Provisioning)
                | (Provisioning, Testing)
                | (Provisioning, Error)
                | (Testing, Accepted)
                | (Testing, Rejected)
                | (Testing, Error)
                | (Accepted | Rejected | Error, TornDown)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accepted,
    Rejected,
    Skipped,
    Error,
}

/// Accept a candidate exactly when its test run passed.
pub fn decide(run: &TestRun) -> Decision {
    if run.passed {
        Decision::Accepted
    } else {
        Decision::Rejected
    }
}

/// One evaluated candidate, or a dependency that never reached a trial
#[derive(Debug, Clone, Serialize)]
pub struct TrialResult {
    pub dependency: Dependency,
    pub candidate: Option<UpdateCandidate>,
    pub test_run: Option<TestRun>,
    pub decision: Decision,
    pub reason: String,
    pub states: Vec<TrialState>,
}

impl TrialResult {
    fn without_trial(
        dependency: &Dependency,
        candidate: Option<UpdateCandidate>,
        decision: Decision,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            dependency: dependency.clone(),
            candidate,
            test_run: None,
            decision,
            reason: reason.into(),
            states: Vec::new(),
        }
    }

    pub fn warning(&self) -> Option<TestWarning> {
        self.test_run.as_ref().and_then(|run| run.warning)
    }

    pub fn is_cancelled(&self) -> bool {
        self.decision == Decision::Error && self.reason == CANCELLED_REASON
    }
}

const CANCELLED_REASON: &str = "cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub report_only: bool,
    pub jobs: usize,
}

/// Walks a trial through its states, rejecting illegal transitions.
struct Trial {
    states: Vec<TrialState>,
}

impl Trial {
    fn new() -> Self {
        Self {
            states: vec![TrialState::Pending],
        }
    }

    fn current(&self) -> TrialState {
        self.states
            .last()
            .copied()
            .unwrap_or(TrialState::Pending)
    }

    fn advance(&mut self, next: TrialState) {
        debug_assert!(
            self.current().can_transition_to(next),
            "illegal trial transition {:?} -> {next:?}",
            self.current()
        );
        self.states.push(next);
    }

    fn finish(
        mut self,
        candidate: &UpdateCandidate,
        test_run: Option<TestRun>,
        decision: Decision,
        reason: String,
    ) -> TrialResult {
        self.advance(TrialState::TornDown);
        TrialResult {
            dependency: candidate.dependency.clone(),
            candidate: Some(candidate.clone()),
            test_run,
            decision,
            reason,
            states: self.states,
        }
    }
}

/// UpdateOrchestrator runs every dependency's candidate trials and decides which pins to adopt
pub struct UpdateOrchestrator<'a> {
    resolver: &'a VersionResolver,
    sandboxes: &'a SandboxManager,
    executor: &'a TestExecutor,
    base: &'a BaseEnvironment,
    policy: UpdatePolicy,
    options: RunOptions,
    cancel: CancellationToken,
}

impl<'a> UpdateOrchestrator<'a> {
    pub fn new(
        resolver: &'a VersionResolver,
        sandboxes: &'a SandboxManager,
        executor: &'a TestExecutor,
        base: &'a BaseEnvironment,
        policy: UpdatePolicy,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            resolver,
            sandboxes,
            executor,
            base,
            policy,
            options,
            cancel,
        }
    }

    /// Evaluate all dependencies on a bounded worker pool. Results come back
    /// grouped per dependency in manifest order. `on_done` fires as each
    /// dependency finishes.
    pub fn run<F>(&self, dependencies: &[Dependency], on_done: F) -> Vec<TrialResult>
    where
        F: Fn(&Dependency, &[TrialResult]) + Sync,
    {
        let next = AtomicUsize::new(0);
        let slots: Mutex<Vec<Option<Vec<TrialResult>>>> =
            Mutex::new(vec![None; dependencies.len()]);
        let workers = self.options.jobs.clamp(1, dependencies.len().max(1));

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        let Some(dependency) = dependencies.get(index) else {
                            break;
                        };
                        let results = self.evaluate_dependency(dependency);
                        on_done(dependency, &results);
                        if let Ok(mut slots) = slots.lock() {
                            slots[index] = Some(results);
                        }
                    }
                });
            }
        });

        let slots = match slots.into_inner() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.into_iter().flatten().flatten().collect()
    }

    /// Newest-first, stopping at the first accepted candidate.
    fn evaluate_dependency(&self, dependency: &Dependency) -> Vec<TrialResult> {
        if self.cancel.is_cancelled() {
            return vec![TrialResult::without_trial(
                dependency,
                None,
                Decision::Error,
                CANCELLED_REASON,
            )];
        }

        if dependency.current_constraint.baseline().is_none() {
            return vec![TrialResult::without_trial(
                dependency,
                None,
                Decision::Skipped,
                "no pinned version",
            )];
        }

        let candidates = match self.resolver.resolve(dependency, &self.policy) {
            Ok(candidates) => candidates,
            Err(err) => {
                tracing::warn!(package = %dependency.name, error = %err, "could not resolve candidates");
                return vec![TrialResult::without_trial(
                    dependency,
                    None,
                    Decision::Error,
                    err.to_string(),
                )];
            }
        };

        let Some(newest) = candidates.first() else {
            return vec![TrialResult::without_trial(
                dependency,
                None,
                Decision::Skipped,
                "no eligible newer version",
            )];
        };

        if self.options.report_only {
            let reason = format!(
                "report only: newest eligible version is {} ({})",
                newest.candidate_version, newest.risk_tier
            );
            return vec![TrialResult::without_trial(
                dependency,
                Some(newest.clone()),
                Decision::Skipped,
                reason,
            )];
        }

        let mut results = Vec::new();
        for candidate in &candidates {
            let result = self.run_trial(candidate);
            let decision = result.decision;
            let cancelled = result.is_cancelled();
            results.push(result);

            match decision {
                Decision::Accepted => break,
                _ if cancelled => break,
                Decision::Rejected | Decision::Error if self.policy.stop_on_first_failure => break,
                _ => {}
            }
        }
        results
    }

    fn run_trial(&self, candidate: &UpdateCandidate) -> TrialResult {
        let name = &candidate.dependency.name;
        let version = &candidate.candidate_version;
        let mut trial = Trial::new();

        if self.cancel.is_cancelled() {
            return TrialResult {
                states: trial.states,
                ..TrialResult::without_trial(
                    &candidate.dependency,
                    Some(candidate.clone()),
                    Decision::Error,
                    CANCELLED_REASON,
                )
            };
        }

        tracing::info!(package = %name, version = %version, tier = %candidate.risk_tier, "trial started");
        trial.advance(TrialState::Provisioning);

        let overrides = [Requirement::pinned(name, version)];
        let sandbox = match self.sandboxes.provision(self.base, &overrides, &self.cancel) {
            Ok(sandbox) => sandbox,
            Err(err) => {
                trial.advance(TrialState::Error);
                return trial.finish(candidate, None, Decision::Error, failure_reason(&err));
            }
        };

        let lease = SandboxLease::new(self.sandboxes, sandbox);
        trial.advance(TrialState::Testing);

        let (test_run, decision, reason) = match self.executor.run(&lease, &self.cancel) {
            Ok(run) => {
                let decision = decide(&run);
                let reason = run_reason(&run);
                (Some(run), decision, reason)
            }
            Err(err) => (None, Decision::Error, failure_reason(&err)),
        };

        if let Err(err) = lease.release() {
            tracing::warn!(package = %name, error = %err, "sandbox teardown reported an error");
        }

        trial.advance(match decision {
            Decision::Accepted => TrialState::Accepted,
            Decision::Rejected => TrialState::Rejected,
            _ => TrialState::Error,
        });

        tracing::info!(package = %name, version = %version, decision = ?decision, "trial finished");
        trial.finish(candidate, test_run, decision, reason)
    }

    /// Write every accepted pin in one atomic manifest rewrite. Returns the
    /// backup path, or `None` when nothing was written.
    pub fn commit(
        &self,
        manifest: &Manifest,
        results: &[TrialResult],
        backup_dir: &Path,
    ) -> Result<Option<PathBuf>> {
        if self.options.dry_run || self.options.report_only {
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            tracing::warn!("run cancelled, manifest left untouched");
            return Ok(None);
        }

        let pins = accepted_pins(results);
        if pins.is_empty() {
            return Ok(None);
        }
        manifest.write_pins(&pins, backup_dir).map(Some)
    }
}

/// Adopted version per dependency, keyed by normalised name.
pub fn accepted_pins(results: &[TrialResult]) -> BTreeMap<String, String> {
    results
        .iter()
        .filter(|r| r.decision == Decision::Accepted)
        .filter_map(|r| {
            let candidate = r.candidate.as_ref()?;
            Some((
                candidate.dependency.normalized_name(),
                candidate.candidate_version.clone(),
            ))
        })
        .collect()
}

fn failure_reason(err: &PkgupError) -> String {
    match err {
        PkgupError::Cancelled => CANCELLED_REASON.to_string(),
        other => other.to_string(),
    }
}

fn run_reason(run: &TestRun) -> String {
    match (run.passed, run.warning) {
        (true, Some(warning)) => format!("accepted with warning: {}", warning.message()),
        (true, None) => format!("{} test file(s) passed", run.tests_discovered),
        (false, _) if run.timed_out => {
            format!("test run timed out after {:.0}s", run.duration.as_secs_f64())
        }
        (false, _) => match run.exit_status {
            Some(code) => format!("tests failed (exit code {code})"),
            None => "tests failed".to_string(),
        },
    }
}
