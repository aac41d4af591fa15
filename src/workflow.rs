use crate::agents::orchestrator::accepted_pins;
use crate::agents::report;
use crate::agents::{
    BaseEnvironment, ConventionDiscovery, Decision, ProjectScannerAgent, PytestRunner,
    RetryPolicy, RunMetadata, RunOptions, SandboxManager, TestExecutor, TrialResult,
    UpdateOrchestrator, UpdatePolicy, UpdateReport, VenvInstaller, VersionResolver,
};
use crate::cli::Cli;
use crate::config::Config;
use crate::error::Result;
use crate::index::IndexFactory;
use crate::manifest::{Dependency, Manifest, normalize_name};
use crate::utils::{CancellationToken, PathValidator};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use jiff::Timestamp;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How a completed run ended, for the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

/// Execute the update verification workflow
pub fn execute_update(cli: &Cli, cancel: CancellationToken) -> Result<RunOutcome> {
    let started_at = Timestamp::now();
    println!("{}", "Starting dependency update verification...".cyan().bold());

    // Step 1: Validate project structure
    println!("\n{}", "1. Validating project structure...".yellow());
    let project_info = ProjectScannerAgent::new(&cli.project_path).validate()?;
    let project_path = project_info.project_path.as_path();
    println!("{}", "✓ Project structure is valid".green());
    println!("   Manifest: {}", project_info.manifest_kind.to_string().bright_cyan());

    // Step 2: Load configuration
    println!("\n{}", "2. Loading configuration...".yellow());
    let mut config = Config::load(project_path)?;
    cli.apply_overrides(&mut config);
    println!(
        "   jobs {}, max tier {}, test timeout {}s",
        config.jobs(),
        config.max_tier,
        config.test_timeout_secs
    );

    // Step 3: Read the manifest
    println!("\n{}", "3. Reading dependency manifest...".yellow());
    let manifest = Manifest::read(&project_info.manifest_path)?;
    let mut warnings = Vec::new();
    let dependencies = select_dependencies(&manifest, &cli.packages, &mut warnings);
    println!(
        "   Found {} dependencies, {} selected",
        manifest.dependencies.len(),
        dependencies.len()
    );
    for warning in &warnings {
        println!("   {}", format!("⚠ {warning}").yellow());
    }

    // Step 4: Trial candidates
    let mode = if cli.report_only {
        "Resolving available updates..."
    } else {
        "Trialling candidate versions in sandboxes..."
    };
    println!("\n{}", format!("4. {mode}").yellow());

    let excluded = excluded_dirs(&config);
    let resolver = VersionResolver::new(
        IndexFactory::create_pypi(&config)?,
        RetryPolicy::from_config(&config),
    );
    let sandboxes = SandboxManager::new(Arc::new(VenvInstaller::new(config.python.clone())))
        .provision_timeout(config.provision_timeout());
    let executor = TestExecutor::new(
        Arc::new(ConventionDiscovery::new(excluded.clone())),
        Arc::new(PytestRunner::new(config.test_args.clone())),
        config.test_timeout(),
    )
    .skip_tests(cli.skip_tests);
    let base = BaseEnvironment::for_manifest(
        project_path,
        &manifest,
        &config.test_requirements,
        excluded,
    )?;
    let orchestrator = UpdateOrchestrator::new(
        &resolver,
        &sandboxes,
        &executor,
        &base,
        UpdatePolicy::from_config(&config),
        RunOptions {
            dry_run: cli.dry_run,
            report_only: cli.report_only,
            jobs: config.jobs(),
        },
        cancel.clone(),
    );

    let pb = ProgressBar::new(dependencies.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  [{bar:40}] {pos}/{len} {msg}")
            .map(|style| style.progress_chars("=>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    let results = orchestrator.run(&dependencies, |dependency, results| {
        pb.println(format!("   {}", describe_outcome(dependency, results)));
        pb.set_message(dependency.name.clone());
        pb.inc(1);
    });
    pb.finish_and_clear();

    let orphans = sandboxes.teardown_all();
    if orphans > 0 {
        warnings.push(format!("{orphans} sandbox(es) had to be removed after the run"));
    }
    let stats = sandboxes.stats();
    tracing::debug!(provisioned = stats.provisioned, torn_down = stats.torn_down, "sandbox usage");

    let cancelled = cancel.is_cancelled();
    if cancelled {
        println!("{}", "⚠ Run cancelled; in-flight sandboxes were removed".red());
    } else {
        println!("{}", "✓ Trials completed".green());
    }

    // Step 5: Apply accepted pins
    let backup = apply_updates(
        cli,
        &orchestrator,
        &manifest,
        &results,
        &config,
        project_path,
        &mut warnings,
    );

    // Step 6: Write the report
    println!("\n{}", "6. Writing report...".yellow());
    let report = report::generate(
        &results,
        RunMetadata {
            started_at,
            finished_at: Timestamp::now(),
            dry_run: cli.dry_run,
            skip_tests: cli.skip_tests,
            report_only: cli.report_only,
            cancelled,
            project: project_path.to_path_buf(),
            manifest: manifest.path.clone(),
            manifest_updated: backup.is_some(),
            backup,
            warnings,
        },
    );
    let report_dir =
        PathValidator::prepare_output_dir(&config.report_dir(project_path), project_path)?;
    let (json_path, md_path) = report.write(&report_dir)?;
    println!("   {}", json_path.display().to_string().dimmed());
    println!("   {}", md_path.display().to_string().dimmed());

    print_summary(&report);

    if cancelled {
        return Ok(RunOutcome::Cancelled);
    }
    println!("\n{}", "✨ Update verification completed!".green().bold());
    Ok(RunOutcome::Completed)
}

fn apply_updates(
    cli: &Cli,
    orchestrator: &UpdateOrchestrator<'_>,
    manifest: &Manifest,
    results: &[TrialResult],
    config: &Config,
    project_path: &Path,
    warnings: &mut Vec<String>,
) -> Option<PathBuf> {
    println!("\n{}", "5. Applying accepted updates...".yellow());
    let pins = accepted_pins(results);

    if pins.is_empty() {
        println!("   {}", "No updates to apply".dimmed());
        return None;
    }
    if cli.dry_run {
        println!("   {}", format!("Dry run: {} update(s) not written", pins.len()).dimmed());
        return None;
    }

    match orchestrator.commit(manifest, results, &config.backup_dir(project_path)) {
        Ok(Some(backup)) => {
            println!(
                "{}",
                format!("✓ {} updated ({} pin(s))", manifest.kind, pins.len()).green()
            );
            println!("   Backup: {}", backup.display().to_string().dimmed());
            Some(backup)
        }
        Ok(None) => {
            println!("   {}", "Manifest left untouched".dimmed());
            None
        }
        Err(err) => {
            println!("{}", format!("⚠ {err}").red());
            warnings.push(format!("manifest was not updated: {err}"));
            None
        }
    }
}

/// Narrow the manifest to `--packages`, warning about names it does not declare.
fn select_dependencies(
    manifest: &Manifest,
    packages: &[String],
    warnings: &mut Vec<String>,
) -> Vec<Dependency> {
    if packages.is_empty() {
        return manifest.dependencies.clone();
    }

    for package in packages {
        if manifest.get(package).is_none() {
            warnings.push(format!("'{package}' is not declared in {}", manifest.kind));
        }
    }
    let wanted: Vec<String> = packages.iter().map(|p| normalize_name(p)).collect();
    manifest
        .dependencies
        .iter()
        .filter(|d| wanted.contains(&d.normalized_name()))
        .cloned()
        .collect()
}

fn excluded_dirs(config: &Config) -> Vec<String> {
    [&config.report_dir, &config.backup_dir]
        .iter()
        .filter_map(|dir| dir.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .collect()
}

fn describe_outcome(dependency: &Dependency, results: &[TrialResult]) -> String {
    let Some(last) = results.last() else {
        return format!("{} (no result)", dependency.name);
    };
    let target = last
        .candidate
        .as_ref()
        .map(|c| format!(" → {}", c.candidate_version))
        .unwrap_or_default();
    let decision = match last.decision {
        Decision::Accepted => "accepted".green(),
        Decision::Rejected => "rejected".red(),
        Decision::Skipped => "skipped".dimmed(),
        Decision::Error => "error".red().bold(),
    };
    format!(
        "• {} {}{target}: {decision} ({})",
        dependency.name.white().bold(),
        dependency.current_constraint.to_string().dimmed(),
        last.reason
    )
}

fn print_summary(report: &UpdateReport) {
    let t = &report.totals;
    println!("\n{}", "📦 Summary:".cyan().bold());
    println!(
        "   {} dependencies, {} trials: {} accepted, {} rejected, {} skipped, {} error",
        t.dependencies,
        t.trials,
        t.accepted.to_string().green(),
        t.rejected.to_string().red(),
        t.skipped,
        t.error.to_string().red()
    );

    let accepted: Vec<_> = report.accepted().collect();
    if !accepted.is_empty() {
        println!("\n{}:", "Accepted updates".cyan().bold());
        for trial in accepted {
            if let Some(candidate) = &trial.candidate {
                let warning = trial
                    .warning()
                    .map(|w| format!(" ({})", w.message()).yellow().to_string())
                    .unwrap_or_default();
                println!(
                    "  • {} {} → {}{warning}",
                    trial.dependency.name.white().bold(),
                    trial.dependency.current_constraint.to_string().red(),
                    candidate.candidate_version.green().bold()
                );
            }
        }
    }

    if t.no_tests_found > 0 {
        println!(
            "\n{}",
            "⚠ No tests were found; accepted updates are unverified".yellow()
        );
    }
    for warning in &report.warnings {
        println!("{}", format!("⚠ {warning}").yellow());
    }
    if report.dry_run && t.accepted > 0 {
        println!("\n{}", "To apply these updates, run without --dry-run".dimmed());
    }
}
