// Engine components, one agent per stage of a run:
// - ProjectScannerAgent: validates the project and finds its manifest
// - VersionResolver: turns a dependency into upgrade candidates
// - SandboxManager: provisions and tears down per-trial environments
// - TestExecutor: runs the project's tests inside a sandbox
// - UpdateOrchestrator: drives each trial through its state machine
// - report: projects trial results into the final UpdateReport
pub mod orchestrator;
pub mod project_scanner;
pub mod report;
pub mod sandbox;
pub mod test_executor;
pub mod version_resolver;

#[cfg(test)]
pub mod testing;

pub use orchestrator::{Decision, RunOptions, TrialResult, UpdateOrchestrator};
pub use project_scanner::ProjectScannerAgent;
pub use report::{RunMetadata, UpdateReport};
pub use sandbox::{BaseEnvironment, SandboxManager, VenvInstaller};
pub use test_executor::{ConventionDiscovery, PytestRunner, TestExecutor};
pub use version_resolver::{RetryPolicy, UpdatePolicy, VersionResolver};
