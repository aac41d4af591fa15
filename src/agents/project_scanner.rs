use crate::error::Result;
use crate::manifest::{Manifest, ManifestKind};
use crate::utils::PathValidator;
use std::path::{Path, PathBuf};

/// ProjectScannerAgent validates the project directory and locates its manifest
pub struct ProjectScannerAgent {
    project_path: PathBuf,
}

impl ProjectScannerAgent {
    pub fn new<P: AsRef<Path>>(project_path: P) -> Self {
        Self {
            project_path: project_path.as_ref().to_path_buf(),
        }
    }

    /// Validates the project structure
    pub fn validate(&self) -> Result<ProjectInfo> {
        let project_path = PathValidator::validate_project_path(&self.project_path)?;

        let manifest_path = Manifest::detect(&project_path)?;
        let manifest_path = PathValidator::validate_file_path(&manifest_path, &project_path)?;
        let manifest_kind = ManifestKind::from_path(&manifest_path)?;

        PathValidator::ensure_writable(&project_path)?;

        Ok(ProjectInfo {
            project_path,
            manifest_path,
            manifest_kind,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ProjectInfo {
    pub project_path: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest_kind: ManifestKind,
}
