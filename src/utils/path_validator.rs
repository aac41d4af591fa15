use crate::error::{PkgupError, Result};
use std::fs;
use std::path::{Path, PathBuf};

const SYSTEM_DIRECTORIES: &[&str] = &["/etc", "/sys", "/proc", "/dev", "/boot"];

/// Path checks applied before the project directory or its manifest is touched.
pub struct PathValidator;

impl PathValidator {
    /// Canonicalise the project path and refuse system directories.
    pub fn validate_project_path(path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();

        let canonical = path.canonicalize().map_err(|e| {
            PkgupError::ProjectValidation(format!(
                "Project path '{}' does not exist: {e}",
                path.display()
            ))
        })?;

        if !canonical.is_dir() {
            return Err(PkgupError::ProjectValidation(format!(
                "Project path '{}' is not a directory",
                canonical.display()
            )));
        }

        let in_system_dir = SYSTEM_DIRECTORIES.iter().map(Path::new).find(|system| {
            canonical.starts_with(system)
                || system
                    .canonicalize()
                    .is_ok_and(|resolved| canonical.starts_with(resolved))
        });
        if let Some(system) = in_system_dir {
            return Err(PkgupError::ProjectValidation(format!(
                "Refusing to operate inside system directory '{}'",
                system.display()
            )));
        }

        Ok(canonical)
    }

    /// Ensure a file (the manifest, a report) resolves inside the project.
    pub fn validate_file_path(
        file_path: impl AsRef<Path>,
        project_root: impl AsRef<Path>,
    ) -> Result<PathBuf> {
        let file_path = file_path.as_ref();

        let canonical_file = file_path.canonicalize().map_err(|e| {
            PkgupError::ProjectValidation(format!("Invalid file path '{}': {e}", file_path.display()))
        })?;
        let canonical_root = project_root.as_ref().canonicalize()?;

        if !canonical_file.starts_with(&canonical_root) {
            return Err(PkgupError::ProjectValidation(format!(
                "'{}' resolves outside the project directory",
                file_path.display()
            )));
        }

        Ok(canonical_file)
    }

    /// The run writes reports, backups and (unless dry-run) the manifest
    /// into the project, so a read-only project is a setup error.
    pub fn ensure_writable(dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        let probe = tempfile::Builder::new()
            .prefix(".pkgup-write-probe")
            .tempfile_in(dir)
            .map_err(|e| {
                PkgupError::ProjectValidation(format!(
                    "Project directory '{}' is not writable: {e}",
                    dir.display()
                ))
            })?;
        drop(probe);
        Ok(())
    }

    /// Create `dir` if needed and confirm it stays inside the project.
    pub fn prepare_output_dir(dir: &Path, project_root: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        Self::validate_file_path(dir, project_root)
    }
}
