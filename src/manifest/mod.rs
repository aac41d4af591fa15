//! Dependency manifests: reading declared pins and rewriting them in place.

pub mod pipfile;
pub mod requirements;

use crate::error::{PkgupError, Result};
use jiff::Zoned;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

pub const REQUIREMENTS_FILE: &str = "requirements.txt";
pub const PIPFILE: &str = "Pipfile";

static SPECIFIER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<op>===|==|>=|<=|~=|!=|>|<)\s*(?P<version>[A-Za-z0-9.*+!_-]+)(?P<rest>.*)$")
        .expect("specifier pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManifestKind {
    Requirements,
    Pipfile,
}

impl ManifestKind {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.file_name().and_then(|n| n.to_str()) {
            Some(name) if name.ends_with(".txt") => Ok(ManifestKind::Requirements),
            Some(PIPFILE) => Ok(ManifestKind::Pipfile),
            _ => Err(PkgupError::ManifestParse(format!(
                "Unsupported manifest kind: {}",
                path.display()
            ))),
        }
    }
}

impl fmt::Display for ManifestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestKind::Requirements => f.write_str(REQUIREMENTS_FILE),
            ManifestKind::Pipfile => f.write_str(PIPFILE),
        }
    }
}

/// A version specifier as written in the manifest, e.g. `>=2.0,<3`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Constraint {
    pub operator: Option<String>,
    pub version: Option<String>,
    /// Everything after the first clause (extra clauses, markers, comments).
    pub trailing: String,
}

impl Constraint {
    pub fn unpinned() -> Self {
        Self {
            operator: None,
            version: None,
            trailing: String::new(),
        }
    }

    /// Parse a specifier string. `*` and empty strings are unpinned; anything
    /// that does not start with a comparison operator is rejected.
    pub fn parse(spec: &str) -> Option<Self> {
        let trimmed = spec.trim();
        if trimmed.is_empty() || trimmed == "*" {
            return Some(Self::unpinned());
        }

        let caps = SPECIFIER_PATTERN.captures(trimmed)?;
        Some(Self {
            operator: Some(caps["op"].to_string()),
            version: Some(caps["version"].to_string()),
            trailing: caps["rest"].trim_end().to_string(),
        })
    }

    /// The version a trial upgrades from, when the constraint names one.
    pub fn baseline(&self) -> Option<&str> {
        let op = self.operator.as_deref()?;
        let version = self.version.as_deref()?;
        if version.contains('*') {
            return None;
        }
        matches!(op, "==" | "===" | ">=" | "~=" | ">").then_some(version)
    }

    /// Operator used when the pin is rewritten to a new version.
    pub fn rewrite_operator(&self) -> &str {
        match self.operator.as_deref() {
            Some(op @ ("==" | "===" | ">=")) => op,
            _ => "==",
        }
    }

    pub fn with_version(&self, version: &str) -> Self {
        Self {
            operator: Some(self.rewrite_operator().to_string()),
            version: Some(version.to_string()),
            trailing: self.trailing.clone(),
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.operator, &self.version) {
            (Some(op), Some(version)) => write!(f, "{op}{version}{}", self.trailing),
            _ if self.trailing.is_empty() => f.write_str("*"),
            _ => f.write_str(self.trailing.trim()),
        }
    }
}

/// A direct dependency declared in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    pub name: String,
    pub current_constraint: Constraint,
    pub source: ManifestKind,
}

impl Dependency {
    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }

    /// Installable form of this dependency as currently declared. Extra
    /// clauses and an environment marker are carried over; comments are not.
    pub fn requirement(&self) -> Requirement {
        let constraint = &self.current_constraint;
        let uncommented = constraint.trailing.split('#').next().unwrap_or_default();
        let (clauses, marker) = match uncommented.split_once(';') {
            Some((clauses, marker)) => (clauses, Some(marker.trim())),
            None => (uncommented, None),
        };

        let mut requirement = Requirement::new(&self.name);
        if let (Some(op), Some(version)) = (&constraint.operator, &constraint.version) {
            let clauses: String = clauses.chars().filter(|c| !c.is_whitespace()).collect();
            requirement.specifier = format!("{op}{version}{clauses}");
        }
        requirement.marker = marker.filter(|m| !m.is_empty()).map(str::to_string);
        requirement
    }
}

/// One requirement as handed to the installer, e.g.
/// `Flask[async]==2.3 ; python_version >= "3.8"` or an editable local path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub extras: Vec<String>,
    /// Version specifier such as `==2.2` or `>=1.0,<3`; empty when unpinned.
    pub specifier: String,
    pub marker: Option<String>,
    /// Local path or VCS URL installed instead of an index release.
    pub location: Option<String>,
    pub editable: bool,
}

impl Requirement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extras: Vec::new(),
            specifier: String::new(),
            marker: None,
            location: None,
            editable: false,
        }
    }

    pub fn pinned(name: &str, version: &str) -> Self {
        Self::new(name).with_specifier(format!("=={version}"))
    }

    pub fn with_specifier(mut self, specifier: impl Into<String>) -> Self {
        self.specifier = specifier.into();
        self
    }

    /// This requirement with its version specifier taken from `other`.
    /// Extras and marker stay; a path or VCS source is replaced by the index release.
    pub fn overridden_by(&self, other: &Requirement) -> Self {
        Self {
            specifier: other.specifier.clone(),
            location: other.location.clone(),
            editable: other.editable,
            ..self.clone()
        }
    }

    pub fn exact_version(&self) -> Option<&str> {
        let version = self
            .specifier
            .strip_prefix("===")
            .or_else(|| self.specifier.strip_prefix("=="))?
            .trim();
        (!version.is_empty() && !version.contains([',', '*'])).then_some(version)
    }

    /// What the sandbox asks for: the exact version, the specifier, or the source location.
    pub fn requested_version(&self) -> &str {
        if let Some(location) = &self.location {
            return location;
        }
        match self.exact_version() {
            Some(version) => version,
            None if self.specifier.is_empty() => "*",
            None => &self.specifier,
        }
    }

    /// Installer arguments for this requirement.
    pub fn install_args(&self) -> Vec<String> {
        match &self.location {
            Some(location) if self.editable => vec!["-e".to_string(), location.clone()],
            Some(location) => vec![location.clone()],
            None => vec![self.to_string()],
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(location) = &self.location {
            let editable = if self.editable { "-e " } else { "" };
            return write!(f, "{editable}{location}");
        }
        f.write_str(&self.name)?;
        if !self.extras.is_empty() {
            write!(f, "[{}]", self.extras.join(","))?;
        }
        f.write_str(&self.specifier)?;
        if let Some(marker) = &self.marker {
            write!(f, " ; {marker}")?;
        }
        Ok(())
    }
}

/// PEP 503 name normalisation.
pub fn normalize_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut in_separator = false;
    for ch in name.trim().chars() {
        if matches!(ch, '-' | '_' | '.') {
            if !in_separator {
                normalized.push('-');
            }
            in_separator = true;
        } else {
            normalized.push(ch.to_ascii_lowercase());
            in_separator = false;
        }
    }
    normalized
}

/// A parsed manifest file
#[derive(Debug, Clone)]
pub struct Manifest {
    pub path: PathBuf,
    pub kind: ManifestKind,
    pub dependencies: Vec<Dependency>,
}

impl Manifest {
    /// Locate the manifest inside a project: requirements.txt first, then Pipfile.
    pub fn detect(project_root: &Path) -> Result<PathBuf> {
        [REQUIREMENTS_FILE, PIPFILE]
            .iter()
            .map(|name| project_root.join(name))
            .find(|path| path.is_file())
            .ok_or_else(|| PkgupError::ManifestNotFound(project_root.to_path_buf()))
    }

    pub fn read(path: &Path) -> Result<Self> {
        let kind = ManifestKind::from_path(path)?;
        let content = Self::read_content(path)?;

        let dependencies = match kind {
            ManifestKind::Requirements => requirements::parse(&content)?,
            ManifestKind::Pipfile => pipfile::parse(&content)?,
        };

        let mut seen = HashSet::new();
        for dep in &dependencies {
            if !seen.insert(dep.normalized_name()) {
                return Err(PkgupError::ManifestParse(format!(
                    "Dependency '{}' is declared more than once in {}",
                    dep.name,
                    path.display()
                )));
            }
        }

        tracing::debug!(path = %path.display(), count = dependencies.len(), "manifest read");

        Ok(Self {
            path: path.to_path_buf(),
            kind,
            dependencies,
        })
    }

    fn read_content(path: &Path) -> Result<String> {
        fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PkgupError::ManifestNotFound(path.to_path_buf()),
            _ => PkgupError::ManifestParse(format!("Failed to read {}: {e}", path.display())),
        })
    }

    pub fn get(&self, name: &str) -> Option<&Dependency> {
        let wanted = normalize_name(name);
        self.dependencies
            .iter()
            .find(|d| d.normalized_name() == wanted)
    }

    /// Every requirement the manifest installs, for manifests that are not
    /// handed to the installer as a file.
    pub fn install_requirements(&self) -> Result<Vec<Requirement>> {
        match self.kind {
            ManifestKind::Requirements => {
                Ok(self.dependencies.iter().map(Dependency::requirement).collect())
            }
            ManifestKind::Pipfile => pipfile::requirements(&Self::read_content(&self.path)?),
        }
    }

    /// Render the manifest with the given pins (keyed by normalised name)
    /// applied. Untouched entries keep their original text.
    pub fn render_with_pins(&self, pins: &BTreeMap<String, String>) -> Result<String> {
        let content = Self::read_content(&self.path)?;
        match self.kind {
            ManifestKind::Requirements => requirements::rewrite(&content, pins),
            ManifestKind::Pipfile => pipfile::rewrite(&content, pins),
        }
    }

    /// Back up the manifest, then replace it atomically with the rewritten pins.
    /// Returns the backup location.
    pub fn write_pins(&self, pins: &BTreeMap<String, String>, backup_dir: &Path) -> Result<PathBuf> {
        let rendered = self
            .render_with_pins(pins)
            .map_err(|e| PkgupError::ManifestWrite(e.to_string()))?;

        let backup = self.create_backup(backup_dir)?;

        let parent = self
            .path
            .parent()
            .ok_or_else(|| PkgupError::ManifestWrite("Manifest has no parent directory".into()))?;
        let write_err =
            |e: std::io::Error| PkgupError::ManifestWrite(format!("{}: {e}", self.path.display()));

        let mut staged = tempfile::NamedTempFile::new_in(parent).map_err(write_err)?;
        staged.write_all(rendered.as_bytes()).map_err(write_err)?;
        staged.flush().map_err(write_err)?;
        if let Ok(metadata) = fs::metadata(&self.path) {
            fs::set_permissions(staged.path(), metadata.permissions()).map_err(write_err)?;
        }
        staged
            .persist(&self.path)
            .map_err(|e| write_err(e.error))?;

        tracing::info!(path = %self.path.display(), updated = pins.len(), "manifest rewritten");
        Ok(backup)
    }

    fn create_backup(&self, backup_dir: &Path) -> Result<PathBuf> {
        let write_err = |e: std::io::Error| {
            PkgupError::ManifestWrite(format!("Failed to back up {}: {e}", self.path.display()))
        };

        fs::create_dir_all(backup_dir).map_err(write_err)?;
        let stamp = Zoned::now().strftime("%Y%m%d_%H%M%S").to_string();
        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("manifest");
        let backup = backup_dir.join(format!("{file_name}.{stamp}.bak"));
        fs::copy(&self.path, &backup).map_err(write_err)?;
        Ok(backup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn normalizes_names() {
        assert_eq!(normalize_name("Flask_SQLAlchemy"), "flask-sqlalchemy");
        assert_eq!(normalize_name("zope..interface"), "zope-interface");
    }

    #[test]
    fn parses_constraints() {
        let c = Constraint::parse(">= 2.0, <3").unwrap();
        assert_eq!(c.operator.as_deref(), Some(">="));
        assert_eq!(c.version.as_deref(), Some("2.0"));
        assert_eq!(c.trailing, ", <3");
        assert_eq!(c.baseline(), Some("2.0"));

        assert_eq!(Constraint::parse("*").unwrap(), Constraint::unpinned());
        assert!(Constraint::parse("latest").is_none());
    }

    #[test]
    fn upper_bounds_have_no_baseline() {
        assert_eq!(Constraint::parse("<3.0").unwrap().baseline(), None);
        assert_eq!(Constraint::parse("==2.*").unwrap().baseline(), None);
        assert_eq!(Constraint::unpinned().baseline(), None);
    }

    #[test]
    fn compatible_release_rewrites_to_exact_pin() {
        let c = Constraint::parse("~=1.4").unwrap();
        assert_eq!(c.with_version("1.6").to_string(), "==1.6");
        let c = Constraint::parse(">=1.4,<2").unwrap();
        assert_eq!(c.with_version("1.6").to_string(), ">=1.6,<2");
    }

    #[test]
    fn requirement_keeps_extra_clauses_and_marker() {
        let dep = Dependency {
            name: "requests".into(),
            current_constraint: Constraint::parse(">=2.0, <3 ; python_version > '3.8'  # http")
                .unwrap(),
            source: ManifestKind::Requirements,
        };
        let requirement = dep.requirement();
        assert_eq!(requirement.specifier, ">=2.0,<3");
        assert_eq!(requirement.marker.as_deref(), Some("python_version > '3.8'"));
        assert_eq!(
            requirement.to_string(),
            "requests>=2.0,<3 ; python_version > '3.8'"
        );
        assert_eq!(requirement.requested_version(), ">=2.0,<3");
    }

    #[test]
    fn override_keeps_extras_and_marker() {
        let mut base = Requirement::new("Flask").with_specifier(">=2.0");
        base.extras = vec!["async".into()];
        base.marker = Some("sys_platform != 'win32'".into());

        let pinned = base.overridden_by(&Requirement::pinned("flask", "2.3"));
        assert_eq!(pinned.to_string(), "Flask[async]==2.3 ; sys_platform != 'win32'");
        assert_eq!(pinned.exact_version(), Some("2.3"));
        assert_eq!(pinned.install_args(), vec![pinned.to_string()]);
    }

    #[test]
    fn local_sources_install_by_location() {
        let mut lib = Requirement::new("local-lib");
        lib.location = Some("./lib".into());
        lib.editable = true;
        assert_eq!(lib.install_args(), vec!["-e", "./lib"]);
        assert_eq!(lib.requested_version(), "./lib");
        assert_eq!(Requirement::new("rich").requested_version(), "*");
    }

    #[test]
    fn detect_prefers_requirements() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(PIPFILE), "[packages]\n").unwrap();
        assert_eq!(
            Manifest::detect(dir.path()).unwrap(),
            dir.path().join(PIPFILE)
        );
        fs::write(dir.path().join(REQUIREMENTS_FILE), "").unwrap();
        assert_eq!(
            Manifest::detect(dir.path()).unwrap(),
            dir.path().join(REQUIREMENTS_FILE)
        );
    }

    #[test]
    fn missing_manifest_is_not_found() {
        let dir = tempdir().unwrap();
        let err = Manifest::detect(dir.path()).unwrap_err();
        assert!(matches!(err, PkgupError::ManifestNotFound(_)));

        let err = Manifest::read(&dir.path().join(REQUIREMENTS_FILE)).unwrap_err();
        assert!(matches!(err, PkgupError::ManifestNotFound(_)));
    }

    #[test]
    fn unsupported_kind_is_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("setup.cfg");
        fs::write(&path, "").unwrap();
        assert!(matches!(
            Manifest::read(&path).unwrap_err(),
            PkgupError::ManifestParse(_)
        ));
    }

    #[test]
    fn duplicate_dependencies_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(REQUIREMENTS_FILE);
        fs::write(&path, "requests==2.0\nRequests>=2.1\n").unwrap();
        assert!(matches!(
            Manifest::read(&path).unwrap_err(),
            PkgupError::ManifestParse(_)
        ));
    }

    #[test]
    fn write_pins_backs_up_and_rewrites() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(REQUIREMENTS_FILE);
        fs::write(&path, "# deps\nrequests==2.0\nflask>=1.0  # web\n").unwrap();

        let manifest = Manifest::read(&path).unwrap();
        let pins = BTreeMap::from([("requests".to_string(), "2.2".to_string())]);
        let backup = manifest
            .write_pins(&pins, &dir.path().join("requirement_backups"))
            .unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "# deps\nrequests==2.2\nflask>=1.0  # web\n"
        );
        assert_eq!(
            fs::read_to_string(backup).unwrap(),
            "# deps\nrequests==2.0\nflask>=1.0  # web\n"
        );
    }
}
