use crate::config::Config;
use crate::error::Result;
use crate::index::PackageIndex;
use crate::manifest::Dependency;
use crate::pypi::{RiskTier, Version, VersionComparator};
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Which upgrades are worth trialling, and how trials of one dependency proceed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePolicy {
    pub max_tier: RiskTier,
    pub include_prereleases: bool,
    pub max_candidates: Option<usize>,
    pub stop_on_first_failure: bool,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            max_tier: RiskTier::Major,
            include_prereleases: false,
            max_candidates: None,
            stop_on_first_failure: false,
        }
    }
}

impl UpdatePolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_tier: config.max_tier,
            include_prereleases: config.include_prereleases,
            max_candidates: config.max_candidates,
            stop_on_first_failure: config.stop_on_first_failure,
        }
    }

    pub fn allows(&self, tier: RiskTier) -> bool {
        tier <= self.max_tier
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateCandidate {
    pub dependency: Dependency,
    pub candidate_version: String,
    pub risk_tier: RiskTier,
}

/// Bounded exponential backoff for index queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retries: config.index_retries,
            base_delay: config.index_backoff(),
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// VersionResolver turns a declared dependency into an ordered list of upgrade candidates
pub struct VersionResolver {
    index: Arc<dyn PackageIndex>,
    retry: RetryPolicy,
}

impl VersionResolver {
    pub fn new(index: Arc<dyn PackageIndex>, retry: RetryPolicy) -> Self {
        Self { index, retry }
    }

    /// Query the index and return eligible candidates, newest first.
    /// An empty result means there is nothing to trial.
    pub fn resolve(
        &self,
        dependency: &Dependency,
        policy: &UpdatePolicy,
    ) -> Result<Vec<UpdateCandidate>> {
        if dependency.current_constraint.baseline().is_none() {
            return Ok(Vec::new());
        }

        let versions = self.list_with_retry(&dependency.name)?;
        let candidates = Self::select_candidates(dependency, &versions, policy);

        tracing::debug!(
            package = %dependency.name,
            published = versions.len(),
            eligible = candidates.len(),
            "resolved upgrade candidates"
        );
        Ok(candidates)
    }

    fn list_with_retry(&self, name: &str) -> Result<Vec<String>> {
        let mut attempt = 0;
        loop {
            match self.index.list_versions(name) {
                Ok(versions) => return Ok(versions),
                Err(err) if err.is_retryable() && attempt < self.retry.retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        package = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "index query failed, retrying"
                    );
                    thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Filter published versions down to trial candidates under `policy`.
    pub fn select_candidates(
        dependency: &Dependency,
        versions: &[String],
        policy: &UpdatePolicy,
    ) -> Vec<UpdateCandidate> {
        let Some(baseline) = dependency.current_constraint.baseline().map(Version::parse) else {
            return Vec::new();
        };

        let eligible = VersionComparator::newest_first(versions)
            .into_iter()
            .filter(|v| v.is_known() && *v > baseline)
            .filter(|v| policy.include_prereleases || !v.is_prerelease())
            .filter_map(|v| {
                let tier = RiskTier::classify(&baseline, &v)?;
                policy.allows(tier).then(|| UpdateCandidate {
                    dependency: dependency.clone(),
                    candidate_version: v.original,
                    risk_tier: tier,
                })
            });

        match policy.max_candidates {
            Some(limit) => eligible.take(limit).collect(),
            None => eligible.collect(),
        }
    }
}
