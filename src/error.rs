use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PkgupError {
    #[error("Project validation failed: {0}")]
    ProjectValidation(String),

    #[error("No dependency manifest found at {}", .0.display())]
    ManifestNotFound(PathBuf),

    #[error("Manifest parsing failed: {0}")]
    ManifestParse(String),

    #[error("Manifest write failed: {0}")]
    ManifestWrite(String),

    #[error("Package index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Package '{0}' was not found on the index")]
    PackageNotFound(String),

    #[error("Sandbox provisioning failed: {0}")]
    SandboxProvision(String),

    #[error("Execution timed out after {}s", .0.as_secs())]
    ExecutionTimeout(Duration),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PkgupError {
    /// Only index outages are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PkgupError::IndexUnavailable(_))
    }

    /// Errors that abort the whole run before any trial starts.
    pub fn is_fatal_setup(&self) -> bool {
        matches!(
            self,
            PkgupError::ProjectValidation(_)
                | PkgupError::ManifestNotFound(_)
                | PkgupError::ManifestParse(_)
                | PkgupError::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PkgupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_index_outages_are_retryable() {
        assert!(PkgupError::IndexUnavailable("503".into()).is_retryable());
        assert!(!PkgupError::PackageNotFound("left-pad".into()).is_retryable());
        assert!(!PkgupError::SandboxProvision("disk full".into()).is_retryable());
    }

    #[test]
    fn manifest_errors_are_fatal_setup() {
        assert!(PkgupError::ManifestNotFound(PathBuf::from("/tmp/x")).is_fatal_setup());
        assert!(PkgupError::ManifestParse("line 3".into()).is_fatal_setup());
        assert!(!PkgupError::ManifestWrite("read-only".into()).is_fatal_setup());
    }

    #[test]
    fn timeout_message_mentions_seconds() {
        let err = PkgupError::ExecutionTimeout(Duration::from_secs(90));
        assert_eq!(err.to_string(), "Execution timed out after 90s");
    }
}
