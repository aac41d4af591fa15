use crate::error::{PkgupError, Result};
use crate::pypi::RiskTier;
use crate::pypi::client::DEFAULT_INDEX_URL;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "pkgup.toml";

/// Project-level settings read from `pkgup.toml`; every key is optional.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub jobs: usize,
    pub max_tier: RiskTier,
    pub include_prereleases: bool,
    pub stop_on_first_failure: bool,
    pub max_candidates: Option<usize>,
    pub test_timeout_secs: u64,
    pub provision_timeout_secs: u64,
    pub index_url: String,
    pub allow_private_index: bool,
    pub index_retries: u32,
    pub index_backoff_ms: u64,
    pub python: String,
    pub report_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub test_args: Vec<String>,
    /// Installed into every sandbox unless the manifest already declares them.
    pub test_requirements: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            jobs: 2,
            max_tier: RiskTier::Major,
            include_prereleases: false,
            stop_on_first_failure: false,
            max_candidates: None,
            test_timeout_secs: 600,
            provision_timeout_secs: 300,
            index_url: DEFAULT_INDEX_URL.to_string(),
            allow_private_index: false,
            index_retries: 3,
            index_backoff_ms: 500,
            python: "python3".to_string(),
            report_dir: PathBuf::from("update_reports"),
            backup_dir: PathBuf::from("requirement_backups"),
            test_args: Vec::new(),
            test_requirements: vec!["pytest".to_string()],
        }
    }
}

impl Config {
    /// Load `pkgup.toml` from the project root, falling back to defaults when absent.
    pub fn load(project_root: &Path) -> Result<Self> {
        let path = project_root.join(CONFIG_FILE);
        if !path.is_file() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .map_err(|e| PkgupError::Config(format!("Failed to read {}: {e}", path.display())))?;
        let config = Self::from_toml(&content)
            .map_err(|e| PkgupError::Config(format!("{}: {e}", path.display())))?;

        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.test_timeout_secs == 0 || self.provision_timeout_secs == 0 {
            return Err(PkgupError::Config("timeouts must be greater than zero".into()));
        }
        if self.max_candidates == Some(0) {
            return Err(PkgupError::Config("max_candidates must be at least 1".into()));
        }
        Ok(())
    }

    pub fn jobs(&self) -> usize {
        self.jobs.max(1)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }

    pub fn index_backoff(&self) -> Duration {
        Duration::from_millis(self.index_backoff_ms)
    }

    pub fn report_dir(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.report_dir)
    }

    pub fn backup_dir(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.backup_dir)
    }
}
