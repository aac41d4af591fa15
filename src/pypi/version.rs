use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::LazyLock;

static RELEASE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)^\s*v?
        (?:(?P<epoch>\d+)!)?
        (?P<release>\d+(?:\.\d+)*)
        (?:[-_.]?(?P<pre>a|alpha|b|beta|c|rc|pre|preview)[-_.]?(?P<pre_n>\d*))?
        (?:-(?P<post_implicit>\d+)|[-_.]?(?P<post_marker>post|rev|r)[-_.]?(?P<post_n>\d*))?
        (?:[-_.]?dev[-_.]?(?P<dev_n>\d*))?
        (?:\+[a-z0-9]+(?:[-_.][a-z0-9]+)*)?
        \s*$",
    )
    .expect("release pattern is valid")
});

/// Version representation for Python package releases
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub original: String,
    pub parsed: VersionType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionType {
    Release(Release),
    Unknown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PreKind {
    Alpha,
    Beta,
    Candidate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub epoch: u64,
    pub segments: Vec<u64>,
    pub pre: Option<(PreKind, u64)>,
    pub post: Option<u64>,
    pub dev: Option<u64>,
}

impl Release {
    fn trimmed_segments(&self) -> &[u64] {
        let end = self
            .segments
            .iter()
            .rposition(|s| *s != 0)
            .map_or(0, |i| i + 1);
        &self.segments[..end]
    }

    fn segment(&self, index: usize) -> u64 {
        self.segments.get(index).copied().unwrap_or(0)
    }

    /// Sort key for the pre-release phase: dev-only < a < b < rc < final.
    fn phase_key(&self) -> (u8, u64) {
        match (self.pre, self.post, self.dev) {
            (None, None, Some(_)) => (0, 0),
            (Some((kind, n)), _, _) => (1 + kind as u8, n),
            _ => (4, 0),
        }
    }

    fn post_key(&self) -> u64 {
        self.post.map_or(0, |n| n + 1)
    }

    fn dev_key(&self) -> (u8, u64) {
        match self.dev {
            Some(n) => (0, n),
            None => (1, 0),
        }
    }

    /// Coerce the release segments into a semver triple for tier comparison.
    fn as_semver(&self) -> semver::Version {
        semver::Version::new(self.segment(0), self.segment(1), self.segment(2))
    }
}

impl Version {
    pub fn parse(version: &str) -> Self {
        let parsed = match Self::parse_release(version) {
            Some(release) => VersionType::Release(release),
            None => VersionType::Unknown(version.to_string()),
        };

        Version {
            original: version.trim().to_string(),
            parsed,
        }
    }

    fn parse_release(version: &str) -> Option<Release> {
        let caps = RELEASE_PATTERN.captures(version)?;
        let number = |name: &str| -> Option<u64> {
            caps.name(name)
                .map(|m| m.as_str().parse::<u64>().unwrap_or(0))
        };

        let segments = caps
            .name("release")?
            .as_str()
            .split('.')
            .map(|s| s.parse::<u64>().ok())
            .collect::<Option<Vec<u64>>>()?;

        let pre = caps.name("pre").map(|kind| {
            let kind = match kind.as_str().to_ascii_lowercase().as_str() {
                "a" | "alpha" => PreKind::Alpha,
                "b" | "beta" => PreKind::Beta,
                _ => PreKind::Candidate,
            };
            (kind, number("pre_n").unwrap_or(0))
        });

        let post = number("post_implicit").or_else(|| {
            caps.name("post_marker")
                .map(|_| number("post_n").unwrap_or(0))
        });

        let dev = number("dev_n");

        Some(Release {
            epoch: number("epoch").unwrap_or(0),
            segments,
            pre,
            post,
            dev,
        })
    }

    pub fn release(&self) -> Option<&Release> {
        match &self.parsed {
            VersionType::Release(release) => Some(release),
            VersionType::Unknown(_) => None,
        }
    }

    pub fn is_known(&self) -> bool {
        self.release().is_some()
    }

    pub fn is_prerelease(&self) -> bool {
        match &self.parsed {
            VersionType::Release(r) => r.pre.is_some() || r.dev.is_some(),
            VersionType::Unknown(_) => true,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.parsed, &other.parsed) {
            (VersionType::Release(a), VersionType::Release(b)) => a
                .epoch
                .cmp(&b.epoch)
                .then_with(|| a.trimmed_segments().cmp(b.trimmed_segments()))
                .then_with(|| a.phase_key().cmp(&b.phase_key()))
                .then_with(|| a.post_key().cmp(&b.post_key()))
                .then_with(|| a.dev_key().cmp(&b.dev_key())),
            (VersionType::Unknown(_), VersionType::Release(_)) => Ordering::Less,
            (VersionType::Release(_), VersionType::Unknown(_)) => Ordering::Greater,
            (VersionType::Unknown(a), VersionType::Unknown(b)) => a.cmp(b),
        }
    }
}

/// How far a candidate moves away from the pinned baseline.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Patch,
    Minor,
    Major,
}

impl RiskTier {
    pub fn classify(baseline: &Version, candidate: &Version) -> Option<RiskTier> {
        let (base, cand) = (baseline.release()?, candidate.release()?);
        if base.epoch != cand.epoch {
            return Some(RiskTier::Major);
        }

        let (base, cand) = (base.as_semver(), cand.as_semver());
        let tier = if base.major != cand.major {
            RiskTier::Major
        } else if base.minor != cand.minor {
            RiskTier::Minor
        } else {
            RiskTier::Patch
        };
        Some(tier)
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RiskTier::Patch => "patch",
            RiskTier::Minor => "minor",
            RiskTier::Major => "major",
        };
        f.write_str(label)
    }
}

pub struct VersionComparator;

impl VersionComparator {
    /// Parse, de-duplicate and order versions from newest to oldest
    pub fn newest_first(versions: &[String]) -> Vec<Version> {
        let mut parsed: Vec<Version> = versions.iter().map(|v| Version::parse(v)).collect();
        parsed.sort();
        parsed.dedup_by(|a, b| Version::cmp(a, b) == Ordering::Equal);
        parsed.reverse();
        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parsing() {
        let v1 = Version::parse("1.0.0");
        let v2 = Version::parse("1.0.1");
        assert!(v2 > v1);
        assert!(v1.is_known());
        assert!(!Version::parse("not-a-version").is_known());
    }

    #[test]
    fn trailing_zeros_compare_equal() {
        assert_eq!(
            Version::parse("2.0").cmp(&Version::parse("2.0.0")),
            Ordering::Equal
        );
        assert!(Version::parse("2.10") > Version::parse("2.9"));
    }

    #[test]
    fn prerelease_ordering() {
        let ordered = [
            "1.0.dev1", "1.0a1", "1.0a2", "1.0b1", "1.0rc1", "1.0", "1.0.post1", "1.1",
        ];
        for pair in ordered.windows(2) {
            assert!(
                Version::parse(pair[0]) < Version::parse(pair[1]),
                "{} should sort before {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_prerelease_detection() {
        assert!(!Version::parse("1.0.0").is_prerelease());
        assert!(Version::parse("1.0.0rc1").is_prerelease());
        assert!(Version::parse("2.0.dev3").is_prerelease());
        assert!(!Version::parse("2.0.post1").is_prerelease());
    }

    #[test]
    fn epochs_dominate_release_numbers() {
        assert!(Version::parse("1!0.1") > Version::parse("9.9"));
    }

    #[test]
    fn classifies_risk_tiers() {
        let base = Version::parse("2.0");
        assert_eq!(
            RiskTier::classify(&base, &Version::parse("2.0.1")),
            Some(RiskTier::Patch)
        );
        assert_eq!(
            RiskTier::classify(&base, &Version::parse("2.2")),
            Some(RiskTier::Minor)
        );
        assert_eq!(
            RiskTier::classify(&base, &Version::parse("3.0")),
            Some(RiskTier::Major)
        );
        assert_eq!(RiskTier::classify(&base, &Version::parse("junk")), None);
    }

    #[test]
    fn newest_first_dedups() {
        let versions = vec![
            "2.1".to_string(),
            "3.0".to_string(),
            "2.1.0".to_string(),
            "2.2".to_string(),
        ];
        let ordered: Vec<String> = VersionComparator::newest_first(&versions)
            .into_iter()
            .map(|v| v.original)
            .collect();
        assert_eq!(ordered.len(), 3);
        assert_eq!(ordered[0], "3.0");
        assert_eq!(ordered[1], "2.2");
    }
}
