use crate::config::Config;
use crate::pypi::RiskTier;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "pkgup",
    about = "Verify Python dependency updates in isolated sandboxes before adopting them",
    version,
    author
)]
pub struct Cli {
    /// Path to the project directory (defaults to current directory)
    #[arg(default_value = ".")]
    pub project_path: String,

    /// Only attempt updates for these packages
    #[arg(long, num_args = 1.., value_name = "PACKAGE")]
    pub packages: Vec<String>,

    /// Run every trial and write the report, but never modify the manifest
    #[arg(long)]
    pub dry_run: bool,

    /// Provision sandboxes but do not run the test suite
    #[arg(long, conflicts_with = "report_only")]
    pub skip_tests: bool,

    /// Only resolve available updates; no sandboxes, no manifest changes
    #[arg(long)]
    pub report_only: bool,

    /// Enable verbose output for debugging
    #[arg(short, long)]
    pub verbose: bool,

    /// Number of dependencies trialled in parallel
    #[arg(short, long, value_name = "N")]
    pub jobs: Option<usize>,

    /// Largest version jump to consider
    #[arg(long, value_enum, value_name = "TIER")]
    pub max_tier: Option<RiskTier>,

    /// Consider pre-release versions (alpha, beta, rc, dev)
    #[arg(long)]
    pub include_prereleases: bool,

    /// Stop trying older candidates for a dependency after its first failure
    #[arg(long)]
    pub stop_on_failure: bool,

    /// Test suite time limit per trial, in seconds
    #[arg(long, value_name = "SECS")]
    pub test_timeout: Option<u64>,
}

impl Cli {
    /// Apply command-line overrides on top of the file configuration.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(jobs) = self.jobs {
            config.jobs = jobs;
        }
        if let Some(tier) = self.max_tier {
            config.max_tier = tier;
        }
        if self.include_prereleases {
            config.include_prereleases = true;
        }
        if self.stop_on_failure {
            config.stop_on_first_failure = true;
        }
        if let Some(secs) = self.test_timeout.filter(|s| *s > 0) {
            config.test_timeout_secs = secs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_flags() {
        let cli = Cli::try_parse_from([
            "pkgup",
            "app",
            "--packages",
            "requests",
            "flask",
            "--dry-run",
            "--max-tier",
            "minor",
            "-j",
            "4",
        ])
        .unwrap();
        assert_eq!(cli.project_path, "app");
        assert_eq!(cli.packages, vec!["requests", "flask"]);
        assert!(cli.dry_run);

        let mut config = Config::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.jobs, 4);
        assert_eq!(config.max_tier, RiskTier::Minor);
        assert!(!config.stop_on_first_failure);
    }

    #[test]
    fn defaults_to_current_directory() {
        let cli = Cli::try_parse_from(["pkgup"]).unwrap();
        assert_eq!(cli.project_path, ".");
        assert!(cli.packages.is_empty());
    }

    #[test]
    fn skip_tests_conflicts_with_report_only() {
        assert!(Cli::try_parse_from(["pkgup", "--skip-tests", "--report-only"]).is_err());
    }
}
