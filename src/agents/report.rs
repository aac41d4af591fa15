use crate::agents::orchestrator::{Decision, TrialResult};
use crate::agents::test_executor::TestWarning;
use crate::error::Result;
use crate::utils::process;
use jiff::Timestamp;
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

/// Tail of captured output repeated in the Markdown rendering.
const MARKDOWN_OUTPUT_TAIL: usize = 4 * 1024;

/// Run-level facts the report carries alongside the trials
#[derive(Debug, Clone)]
pub struct RunMetadata {
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub dry_run: bool,
    pub skip_tests: bool,
    pub report_only: bool,
    pub cancelled: bool,
    pub project: PathBuf,
    pub manifest: PathBuf,
    pub manifest_updated: bool,
    pub backup: Option<PathBuf>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub dependencies: usize,
    pub trials: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub skipped: usize,
    pub error: usize,
    pub no_tests_found: usize,
}

/// Immutable record of one invocation
#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub dry_run: bool,
    pub skip_tests: bool,
    pub report_only: bool,
    pub cancelled: bool,
    pub project: PathBuf,
    pub manifest: PathBuf,
    pub manifest_updated: bool,
    pub backup: Option<PathBuf>,
    pub totals: Totals,
    pub trials: Vec<TrialResult>,
    pub warnings: Vec<String>,
}

/// Project the trial results into a report. Every result is kept, in order.
pub fn generate(results: &[TrialResult], metadata: RunMetadata) -> UpdateReport {
    let mut totals = Totals::default();
    let mut seen = Vec::new();

    for result in results {
        let name = result.dependency.normalized_name();
        if !seen.contains(&name) {
            seen.push(name);
        }
        if result.test_run.is_some() {
            totals.trials += 1;
        }
        match result.decision {
            Decision::Accepted => totals.accepted += 1,
            Decision::Rejected => totals.rejected += 1,
            Decision::Skipped => totals.skipped += 1,
            Decision::Error => totals.error += 1,
        }
        if result.warning() == Some(TestWarning::NoTestsFound) {
            totals.no_tests_found += 1;
        }
    }
    totals.dependencies = seen.len();

    UpdateReport {
        started_at: metadata.started_at,
        finished_at: metadata.finished_at,
        dry_run: metadata.dry_run,
        skip_tests: metadata.skip_tests,
        report_only: metadata.report_only,
        cancelled: metadata.cancelled,
        project: metadata.project,
        manifest: metadata.manifest,
        manifest_updated: metadata.manifest_updated,
        backup: metadata.backup,
        totals,
        trials: results.to_vec(),
        warnings: metadata.warnings,
    }
}

impl UpdateReport {
    pub fn accepted(&self) -> impl Iterator<Item = &TrialResult> {
        self.trials
            .iter()
            .filter(|t| t.decision == Decision::Accepted)
    }

    pub fn duration_secs(&self) -> f64 {
        self.finished_at
            .duration_since(self.started_at)
            .as_secs_f64()
            .max(0.0)
    }

    fn mode(&self) -> &'static str {
        match (self.report_only, self.dry_run, self.skip_tests) {
            (true, _, _) => "report only",
            (false, true, _) => "dry run",
            (false, false, true) => "apply (tests skipped)",
            (false, false, false) => "apply",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn render_markdown(&self) -> String {
        let mut md = String::new();
        let _ = writeln!(md, "# Package Update Report\n");
        let _ = writeln!(md, "- Started: {}", self.started_at);
        let _ = writeln!(md, "- Finished: {} ({:.1}s)", self.finished_at, self.duration_secs());
        let _ = writeln!(md, "- Project: `{}`", self.project.display());
        let _ = writeln!(md, "- Manifest: `{}`", self.manifest.display());
        let _ = writeln!(md, "- Mode: {}", self.mode());
        if self.cancelled {
            let _ = writeln!(md, "- **Run was cancelled before completion**");
        }

        let t = &self.totals;
        let _ = writeln!(md, "\n## Summary\n");
        let _ = writeln!(md, "| Dependencies | Trials | Accepted | Rejected | Skipped | Error |");
        let _ = writeln!(md, "|---|---|---|---|---|---|");
        let _ = writeln!(
            md,
            "| {} | {} | {} | {} | {} | {} |",
            t.dependencies, t.trials, t.accepted, t.rejected, t.skipped, t.error
        );
        if t.no_tests_found > 0 {
            let _ = writeln!(
                md,
                "\n> **Warning:** {} accepted trial(s) found no tests; those updates are unverified.",
                t.no_tests_found
            );
        }

        let _ = writeln!(md, "\n## Quick Update Guide\n");
        let accepted: Vec<&TrialResult> = self.accepted().collect();
        if accepted.is_empty() {
            let _ = writeln!(md, "No updates were accepted.");
        } else {
            if self.manifest_updated {
                let _ = writeln!(md, "The manifest was updated. To sync an environment:\n");
            } else {
                let _ = writeln!(md, "Validated updates (manifest not modified):\n");
            }
            let _ = writeln!(md, "```bash");
            for trial in &accepted {
                if let Some(candidate) = &trial.candidate {
                    let _ = writeln!(
                        md,
                        "pip install {}=={}",
                        trial.dependency.name, candidate.candidate_version
                    );
                }
            }
            let _ = writeln!(md, "```");
        }
        if let Some(backup) = &self.backup {
            let _ = writeln!(md, "\nPrevious manifest saved to `{}`.", backup.display());
        }

        let _ = writeln!(md, "\n## Details\n");
        let mut current: Option<String> = None;
        for trial in &self.trials {
            let name = trial.dependency.normalized_name();
            if current.as_ref() != Some(&name) {
                let _ = writeln!(
                    md,
                    "### {} (`{}`)\n",
                    trial.dependency.name, trial.dependency.current_constraint
                );
                current = Some(name);
            }
            render_trial(&mut md, trial);
        }

        if !self.warnings.is_empty() {
            let _ = writeln!(md, "## Warnings\n");
            for warning in &self.warnings {
                let _ = writeln!(md, "- {warning}");
            }
        }
        md
    }

    /// Write `update_report_<timestamp>.json` and `.md` into `dir`.
    pub fn write(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        fs::create_dir_all(dir)?;
        let stem = format!("update_report_{}", self.started_at.strftime("%Y%m%d_%H%M%S"));
        let json_path = dir.join(format!("{stem}.json"));
        let md_path = dir.join(format!("{stem}.md"));

        fs::write(&json_path, self.to_json()?)?;
        fs::write(&md_path, self.render_markdown())?;

        tracing::debug!(json = %json_path.display(), markdown = %md_path.display(), "report written");
        Ok((json_path, md_path))
    }
}

fn render_trial(md: &mut String, trial: &TrialResult) {
    let label = match trial.decision {
        Decision::Accepted => "ACCEPTED",
        Decision::Rejected => "REJECTED",
        Decision::Skipped => "SKIPPED",
        Decision::Error => "ERROR",
    };
    match &trial.candidate {
        Some(candidate) => {
            let _ = writeln!(
                md,
                "- **{label}** {} ({} update): {}",
                candidate.candidate_version, candidate.risk_tier, trial.reason
            );
        }
        None => {
            let _ = writeln!(md, "- **{label}**: {}", trial.reason);
        }
    }

    let Some(run) = &trial.test_run else {
        return;
    };
    let _ = writeln!(
        md,
        "  - sandbox {}, {:.1}s, exit status {}",
        run.sandbox_id,
        run.duration.as_secs_f64(),
        run.exit_status
            .map(|code| code.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    if let Some(warning) = run.warning {
        let _ = writeln!(md, "  - warning: {}", warning.message());
    }
    if matches!(trial.decision, Decision::Rejected | Decision::Error)
        && !run.captured_output.trim().is_empty()
    {
        let _ = writeln!(md, "\n```text");
        let _ = writeln!(
            md,
            "{}",
            process::tail(run.captured_output.trim_end(), MARKDOWN_OUTPUT_TAIL)
        );
        let _ = writeln!(md, "```\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::orchestrator::TrialState;
    use crate::agents::testing::dependency;
    use crate::agents::version_resolver::UpdateCandidate;
    use crate::pypi::RiskTier;
    use tempfile::tempdir;

    fn metadata() -> RunMetadata {
        let started_at: Timestamp = "2026-03-01T10:00:00Z".parse().unwrap();
        RunMetadata {
            started_at,
            finished_at: "2026-03-01T10:02:30Z".parse().unwrap(),
            dry_run: false,
            skip_tests: false,
            report_only: false,
            cancelled: false,
            project: PathBuf::from("/work/app"),
            manifest: PathBuf::from("/work/app/requirements.txt"),
            manifest_updated: true,
            backup: None,
            warnings: vec!["example warning".into()],
        }
    }

    fn trial(name: &str, version: Option<&str>, decision: Decision, reason: &str) -> TrialResult {
        let dep = dependency(name, "==1.0");
        TrialResult {
            candidate: version.map(|v| UpdateCandidate {
                dependency: dep.clone(),
                candidate_version: v.to_string(),
                risk_tier: RiskTier::Minor,
            }),
            dependency: dep,
            test_run: None,
            decision,
            reason: reason.to_string(),
            states: vec![TrialState::Pending],
        }
    }

    #[test]
    fn keeps_every_result_and_counts_decisions() {
        let results = vec![
            trial("flask", Some("1.2"), Decision::Rejected, "tests failed (exit code 1)"),
            trial("flask", Some("1.1"), Decision::Accepted, "1 test file(s) passed"),
            trial("six", None, Decision::Skipped, "no eligible newer version"),
            trial("numpy", None, Decision::Error, "Package index unavailable: timeout"),
        ];
        let report = generate(&results, metadata());

        assert_eq!(report.trials.len(), 4);
        assert_eq!(
            report.totals,
            Totals {
                dependencies: 3,
                trials: 0,
                accepted: 1,
                rejected: 1,
                skipped: 1,
                error: 1,
                no_tests_found: 0,
            }
        );
        assert_eq!(report.duration_secs(), 150.0);
    }

    #[test]
    fn markdown_lists_reasons_and_install_guide() {
        let results = vec![
            trial("flask", Some("1.1"), Decision::Accepted, "1 test file(s) passed"),
            trial("numpy", None, Decision::Error, "Package index unavailable: timeout"),
        ];
        let md = generate(&results, metadata()).render_markdown();

        assert!(md.contains("pip install flask==1.1"));
        assert!(md.contains("**ERROR**: Package index unavailable: timeout"));
        assert!(md.contains("### numpy (`==1.0`)"));
        assert!(md.contains("- example warning"));
    }

    #[test]
    fn writes_json_and_markdown_side_by_side() {
        let dir = tempdir().unwrap();
        let report = generate(
            &[trial("flask", Some("1.1"), Decision::Accepted, "ok")],
            metadata(),
        );
        let (json, md) = report.write(&dir.path().join("update_reports")).unwrap();

        assert_eq!(
            json.file_name().unwrap(),
            "update_report_20260301_100000.json"
        );
        assert!(md.is_file());
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(json).unwrap()).unwrap();
        assert_eq!(value["trials"][0]["decision"], "accepted");
        assert_eq!(value["trials"][0]["candidate"]["risk_tier"], "minor");
        assert_eq!(value["totals"]["accepted"], 1);
    }
}
